//! Interactive session driver: wraps an agent streaming handle and
//! records the conversation into the session's thread as it flows.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::WorkspaceManager;
use crate::agent::{InteractiveHandle, StreamEvent};
use crate::store::Store;
use crate::types::{MessageRole, SessionStatus, Thread};

pub struct InteractiveSession {
    session_id: String,
    thread: Thread,
    handle: InteractiveHandle,
    store: Arc<Store>,
}

impl WorkspaceManager {
    /// Spawn the agent in streaming mode for a session and open a thread
    /// recording the exchange. The session's initial prompt becomes the
    /// first user message.
    pub async fn start_interactive(&self, session_id: &str) -> Result<InteractiveSession> {
        let session = self.require_session(session_id)?;

        let handle = self.adapter.start_interactive(
            &session.id,
            &session.prompt,
            &session.worktree_path,
            session.model_override.as_deref(),
        )?;

        let thread = self.store.create_thread(&session.id)?;
        self.store
            .add_thread_message(&thread.id, MessageRole::User, &session.prompt)?;
        self.store
            .update_session_status(&session.id, SessionStatus::Running)?;

        info!(session = %session.id, thread = %thread.id, "Interactive session started");
        Ok(InteractiveSession {
            session_id: session.id,
            thread,
            handle,
            store: self.store.clone(),
        })
    }
}

impl InteractiveSession {
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn handle(&mut self) -> &mut InteractiveHandle {
        &mut self.handle
    }

    /// Forward one user message to the agent and record it.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        self.handle.send(text).await?;
        self.store
            .add_thread_message(&self.thread.id, MessageRole::User, text)
            .context("failed to record user message")?;
        Ok(())
    }

    /// Next handle event; assistant text frames are recorded into the
    /// thread before being returned.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.handle.next_event().await?;
        if let StreamEvent::Frame(frame) = &event {
            if let Some(text) = assistant_text(frame) {
                if let Err(e) =
                    self.store
                        .add_thread_message(&self.thread.id, MessageRole::Assistant, &text)
                {
                    warn!(error = %e, "Failed to record assistant message");
                }
            }
        }
        Some(event)
    }

    /// Stop the agent and return the session to idle.
    pub async fn stop(&mut self) -> Result<()> {
        self.handle.stop().await?;
        self.store
            .update_session_status(&self.session_id, SessionStatus::Idle)?;
        Ok(())
    }
}

/// Pull displayable assistant text out of a streaming frame. Handles
/// both the enveloped message shape and bare text frames.
fn assistant_text(frame: &serde_json::Value) -> Option<String> {
    if frame.get("type").and_then(|t| t.as_str()) != Some("assistant") {
        return None;
    }
    if let Some(content) = frame
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    {
        let text: String = content
            .iter()
            .filter_map(|block| {
                (block.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| block.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            return Some(text);
        }
    }
    frame
        .get("text")
        .and_then(|t| t.as_str())
        .map(str::to_string)
}
