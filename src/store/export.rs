//! Session export/import: a structured snapshot of a session and every
//! row hanging off it, suitable for re-importing into a fresh store.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{FollowUpPrompt, Store};
use crate::types::{Iteration, Session, Thread, ThreadMessage, ToolCall};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: Session,
    pub iterations: Vec<Iteration>,
    pub tool_calls: Vec<ToolCall>,
    pub threads: Vec<Thread>,
    pub thread_messages: Vec<ThreadMessage>,
    pub follow_up_prompts: Vec<FollowUpPrompt>,
}

impl Store {
    pub fn export_session(&self, session_id: &str) -> Result<SessionExport> {
        let Some(session) = self.get_session(session_id)? else {
            bail!("unknown session id: {session_id}");
        };

        let threads = self.threads_for(session_id)?;
        let mut thread_messages = Vec::new();
        for thread in &threads {
            thread_messages.extend(self.thread_messages(&thread.id)?);
        }

        Ok(SessionExport {
            iterations: self.iterations_for(session_id)?,
            tool_calls: self.tool_calls_for(session_id, None)?,
            follow_up_prompts: self.follow_up_prompts_for(session_id)?,
            threads,
            thread_messages,
            session,
        })
    }

    /// Re-create an exported session. Fails if the session id already
    /// exists; row identity is preserved.
    pub fn import_session(&self, export: &SessionExport) -> Result<()> {
        if self.get_session(&export.session.id)?.is_some() {
            bail!("session '{}' already exists", export.session.id);
        }

        self.insert_session(&export.session)?;
        for iteration in &export.iterations {
            self.import_iteration_row(iteration)?;
        }
        for call in &export.tool_calls {
            self.insert_tool_call(call)?;
        }
        for thread in &export.threads {
            self.import_thread_row(thread)?;
        }
        for message in &export.thread_messages {
            self.import_thread_message_row(message)?;
        }
        for prompt in &export.follow_up_prompts {
            self.import_follow_up_row(prompt)?;
        }
        Ok(())
    }

    // Imports bypass the usual creation helpers so ids, indices, and
    // closed-iteration fields survive verbatim.

    fn import_iteration_row(&self, iteration: &Iteration) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO iterations (
                    id, session_id, started_at, ended_at, commit_sha,
                    changed_files, exit_code, test_result, prompt_tokens,
                    completion_tokens, total_tokens, model, agent_version,
                    command_line, output
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                rusqlite::params![
                    iteration.id,
                    iteration.session_id,
                    iteration.started_at,
                    iteration.ended_at,
                    iteration.commit_sha,
                    iteration.changed_files,
                    iteration.exit_code,
                    iteration.test_result.map(crate::types::TestResult::as_str),
                    iteration.prompt_tokens.map(|v| v as i64),
                    iteration.completion_tokens.map(|v| v as i64),
                    iteration.total_tokens.map(|v| v as i64),
                    iteration.model,
                    iteration.agent_version,
                    iteration.command_line,
                    iteration.output,
                ],
            )?;
            Ok(())
        })
    }

    fn import_thread_row(&self, thread: &Thread) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (id, session_id, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![thread.id, thread.session_id, thread.created_at],
            )?;
            Ok(())
        })
    }

    fn import_thread_message_row(&self, message: &ThreadMessage) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO thread_messages (id, thread_id, idx, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    message.id,
                    message.thread_id,
                    message.idx,
                    message.role.as_str(),
                    message.content,
                    message.created_at,
                ],
            )?;
            Ok(())
        })
    }

    fn import_follow_up_row(&self, prompt: &FollowUpPrompt) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO follow_up_prompts (id, session_id, prompt, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![prompt.id, prompt.session_id, prompt.prompt, prompt.created_at],
            )?;
            Ok(())
        })
    }
}
