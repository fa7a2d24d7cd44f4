//! Interactive streaming handle for a long-lived agent process.
//!
//! The agent is spawned with streaming-JSON input and output. Input is
//! one JSON envelope per line; output frames are parsed and forwarded as
//! events. The handle owns the single writer (its stdin) and the single
//! reader (the pump tasks).

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::adapter::{stop_child, AgentAdapter};

/// Delay after which a spawned handle is considered ready for input.
const READY_DELAY: Duration = Duration::from_millis(500);

/// How long `stop` waits after closing stdin before escalating.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Handle lifecycle. Transitions are monotonic in declaration order,
/// except that `Ready` may move directly to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandleState {
    Connecting,
    Ready,
    Closed,
    Error,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    State(HandleState),
    /// One parsed assistant/tool/output frame.
    Frame(serde_json::Value),
    Error(String),
}

#[derive(Debug, Clone)]
struct SharedState {
    inner: Arc<Mutex<HandleState>>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl SharedState {
    fn get(&self) -> HandleState {
        *self.inner.lock().expect("state mutex poisoned")
    }

    /// Advance the state machine; backwards transitions are ignored.
    fn advance(&self, next: HandleState) {
        let mut state = self.inner.lock().expect("state mutex poisoned");
        if next > *state {
            debug!(from = ?*state, to = ?next, "Interactive handle state change");
            *state = next;
            let _ = self.events.send(StreamEvent::State(next));
        }
    }
}

pub struct InteractiveHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    state: SharedState,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    stopped: bool,
}

impl AgentAdapter {
    /// Spawn the agent in streaming mode for a session.
    pub fn start_interactive(
        &self,
        session_id: &str,
        initial_prompt: &str,
        workspace: &std::path::Path,
        model: Option<&str>,
    ) -> Result<InteractiveHandle> {
        let mut args = vec![
            "--execute".to_string(),
            initial_prompt.to_string(),
            "--stream-json".to_string(),
            "--stream-json-input".to_string(),
        ];
        if let Some(model) = model {
            match super::adapter::model_alias_flag(model) {
                Some(flag) => args.push(flag.to_string()),
                None => warn!(model, "No alias flag for model override; ignoring"),
            }
        }

        debug!(session = session_id, "Spawning interactive agent");
        let mut cmd = Command::new(self.binary());
        cmd.args(&args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.apply_env(&mut cmd);

        let mut child = cmd.spawn().with_context(|| {
            format!("failed to spawn agent binary '{}'", self.binary())
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = SharedState {
            inner: Arc::new(Mutex::new(HandleState::Connecting)),
            events: events_tx,
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Output pump: parse frames, redact text, detect clean close.
        if let Some(stdout) = stdout {
            let state = state.clone();
            let redactor = self.redactor().clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = redactor.redact(&line);
                    match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(frame) => {
                            let _ = state.events.send(StreamEvent::Frame(frame));
                        }
                        Err(_) if !line.trim().is_empty() => {
                            let _ = state
                                .events
                                .send(StreamEvent::Frame(json!({ "type": "text", "text": line })));
                        }
                        Err(_) => {}
                    }
                }
                state.advance(HandleState::Closed);
            });
        }

        // Stderr pump: fatal errors flip the handle to Error.
        if let Some(stderr) = stderr {
            let state = state.clone();
            let redactor = self.redactor().clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = redactor.redact(&line);
                    let lower = line.to_lowercase();
                    if lower.contains("fatal") || lower.starts_with("error:") {
                        warn!(line = %line, "Interactive agent reported fatal error");
                        let _ = state.events.send(StreamEvent::Error(line));
                        state.advance(HandleState::Error);
                    } else if !line.trim().is_empty() {
                        debug!(line = %line, "agent stderr");
                    }
                }
            });
        }

        // Fixed initialization delay; the agent offers no explicit
        // handshake frame.
        {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(READY_DELAY).await;
                state.advance(HandleState::Ready);
            });
        }

        Ok(InteractiveHandle {
            child,
            stdin,
            state,
            events: events_rx,
            stopped: false,
        })
    }

}

impl InteractiveHandle {
    pub fn state(&self) -> HandleState {
        self.state.get()
    }

    /// Receive the next handle event; `None` after all pumps finish.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Write one user-message envelope. Valid only while ready.
    pub async fn send(&mut self, text: &str) -> Result<()> {
        if self.state.get() != HandleState::Ready {
            bail!("interactive handle is not ready (state: {:?})", self.state.get());
        }
        let Some(stdin) = self.stdin.as_mut() else {
            bail!("interactive handle stdin already closed");
        };

        let envelope = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": text }],
            },
        });
        let mut line = envelope.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .context("failed to write to agent stdin")?;
        stdin.flush().await.context("failed to flush agent stdin")?;
        Ok(())
    }

    /// Close stdin, await exit within a grace period, then terminate and
    /// finally kill. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        // Closing stdin asks the agent to wind down on its own.
        drop(self.stdin.take());

        if tokio::time::timeout(STOP_GRACE, self.child.wait())
            .await
            .is_err()
        {
            stop_child(&mut self.child).await;
        }
        self.state.advance(HandleState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering_is_monotonic() {
        assert!(HandleState::Connecting < HandleState::Ready);
        assert!(HandleState::Ready < HandleState::Closed);
        assert!(HandleState::Closed < HandleState::Error);
    }

    #[test]
    fn test_advance_ignores_backwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = SharedState {
            inner: Arc::new(Mutex::new(HandleState::Connecting)),
            events: tx,
        };

        state.advance(HandleState::Ready);
        state.advance(HandleState::Connecting); // ignored
        assert_eq!(state.get(), HandleState::Ready);

        state.advance(HandleState::Error); // ready -> error is legal
        assert_eq!(state.get(), HandleState::Error);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::State(s) = event {
                seen.push(s);
            }
        }
        assert_eq!(seen, vec![HandleState::Ready, HandleState::Error]);
    }

    #[cfg(unix)]
    mod spawn_tests {
        use super::*;
        use crate::config::AgentSettings;
        use std::collections::HashMap;
        use std::os::unix::fs::PermissionsExt;

        fn stub_settings(dir: &std::path::Path, body: &str) -> AgentSettings {
            let path = dir.join("interactive-stub.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            AgentSettings {
                binary: path.to_string_lossy().to_string(),
                extra_args: Vec::new(),
                json_logs: false,
                env: HashMap::new(),
                server_url: None,
            }
        }

        #[tokio::test]
        async fn test_echo_agent_round_trip() {
            let temp = tempfile::TempDir::new().unwrap();
            // Echo agent: one JSON frame per stdin line, exits on EOF.
            let settings = stub_settings(
                temp.path(),
                r#"while IFS= read -r line; do echo "{\"type\":\"assistant\",\"echo\":true}"; done"#,
            );
            let adapter = AgentAdapter::new(settings);
            let mut handle = adapter
                .start_interactive("s1", "hello", temp.path(), None)
                .unwrap();

            // Wait for ready.
            loop {
                match handle.next_event().await {
                    Some(StreamEvent::State(HandleState::Ready)) => break,
                    Some(_) => continue,
                    None => panic!("handle closed before ready"),
                }
            }

            handle.send("are you there").await.unwrap();

            // Expect an assistant frame back.
            let mut got_frame = false;
            for _ in 0..10 {
                match tokio::time::timeout(Duration::from_secs(2), handle.next_event()).await {
                    Ok(Some(StreamEvent::Frame(frame))) => {
                        assert_eq!(frame["type"], "assistant");
                        got_frame = true;
                        break;
                    }
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
            assert!(got_frame, "expected an echoed frame");

            handle.stop().await.unwrap();
            assert_eq!(handle.state(), HandleState::Closed);
            // Idempotent.
            handle.stop().await.unwrap();
        }

        #[tokio::test]
        async fn test_send_before_ready_fails() {
            let temp = tempfile::TempDir::new().unwrap();
            let settings = stub_settings(temp.path(), "sleep 5");
            let adapter = AgentAdapter::new(settings);
            let mut handle = adapter
                .start_interactive("s1", "hello", temp.path(), None)
                .unwrap();

            // Immediately after spawn the handle is still connecting.
            let err = handle.send("too early").await.unwrap_err();
            assert!(err.to_string().contains("not ready"));

            handle.stop().await.unwrap();
        }

        #[tokio::test]
        async fn test_clean_exit_moves_to_closed() {
            let temp = tempfile::TempDir::new().unwrap();
            let settings = stub_settings(temp.path(), "echo '{\"type\":\"assistant\"}'");
            let adapter = AgentAdapter::new(settings);
            let mut handle = adapter
                .start_interactive("s1", "hello", temp.path(), None)
                .unwrap();

            let mut closed = false;
            for _ in 0..20 {
                match tokio::time::timeout(Duration::from_secs(2), handle.next_event()).await {
                    Ok(Some(StreamEvent::State(HandleState::Closed))) => {
                        closed = true;
                        break;
                    }
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
            assert!(closed, "expected closed state after agent exit");
        }
    }
}
