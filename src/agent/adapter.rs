//! One-shot agent invocations and auth validation.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::redact::SecretRedactor;
use super::telemetry::{parse_output, Telemetry};
use crate::config::AgentSettings;

/// Hard cap on captured agent output.
const MAX_CAPTURE_BYTES: usize = 2 * 1024 * 1024;

/// Grace period between closing/terminating and killing the agent.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Auth probe deadline.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Model names with a dedicated agent alias flag. Unknown models log a
/// warning and pass no flag.
const MODEL_ALIAS_FLAGS: &[(&str, &str)] = &[
    ("gpt-5", "--try-gpt5"),
    ("claude-opus", "--try-opus"),
    ("claude-sonnet", "--try-sonnet"),
];

static THREAD_ID_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""thread_?[iI]d"\s*:\s*"([A-Za-z0-9_-]+)""#).unwrap());
static THREAD_ID_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bthread(?:\s+id)?:\s*([A-Za-z0-9][A-Za-z0-9_-]+)"#).unwrap());

#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub prompt: &'a str,
    pub workspace: &'a Path,
    pub model: Option<&'a str>,
    /// Known external thread id; switches to the continue-thread form.
    pub thread_id: Option<&'a str>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub exit: i32,
    /// Merged stdout/stderr, redacted and capped.
    pub output: String,
    pub telemetry: Telemetry,
    /// The agent exited cleanly but did nothing except ask the user.
    pub awaiting_input: bool,
    /// Thread id the agent reported, if any.
    pub thread_id: Option<String>,
    /// Full command line, for the iteration record.
    pub command_line: String,
}

#[derive(Debug, Clone)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub error: Option<String>,
    pub suggestion: Option<String>,
    pub has_credits: bool,
}

#[derive(Debug, Clone)]
pub struct AgentAdapter {
    settings: AgentSettings,
    redactor: SecretRedactor,
}

impl AgentAdapter {
    pub fn new(settings: AgentSettings) -> Self {
        // Configured env overrides that look like credentials join the
        // redaction set alongside the ambient auth token.
        let extra_keys: Vec<String> = settings
            .env
            .iter()
            .filter(|(k, _)| {
                let k = k.to_ascii_uppercase();
                k.contains("TOKEN") || k.contains("KEY") || k.contains("SECRET")
            })
            .map(|(_, v)| v.clone())
            .collect();
        let redactor = SecretRedactor::from_env(&extra_keys);
        Self { settings, redactor }
    }

    pub fn binary(&self) -> &str {
        &self.settings.binary
    }

    pub fn redactor(&self) -> &SecretRedactor {
        &self.redactor
    }

    /// Arguments for a one-shot turn.
    pub(crate) fn one_shot_args(
        &self,
        prompt: &str,
        model: Option<&str>,
        thread_id: Option<&str>,
    ) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(thread_id) = thread_id {
            args.push("threads".to_string());
            args.push("continue".to_string());
            args.push(thread_id.to_string());
        }
        args.push("--execute".to_string());
        args.push(prompt.to_string());
        if self.settings.json_logs {
            args.push(super::JSON_LOGS_FLAG.to_string());
        }
        if let Some(model) = model {
            match model_alias_flag(model) {
                Some(flag) => args.push(flag.to_string()),
                None => warn!(model, "No alias flag for model override; ignoring"),
            }
        }
        args.extend(self.settings.extra_args.iter().cloned());
        args
    }

    pub(crate) fn apply_env(&self, cmd: &mut Command) {
        for (key, value) in &self.settings.env {
            cmd.env(key, value);
        }
        // The ambient auth token is inherited; the endpoint is explicit.
        if let Some(url) = &self.settings.server_url {
            cmd.env(super::URL_ENV, url);
            if url.contains("localhost") || url.contains("127.0.0.1") {
                cmd.env(super::TLS_REJECT_ENV, "0");
            }
        }
    }

    /// Run one agent turn to completion and parse its telemetry.
    pub async fn run_iteration(&self, request: RunRequest<'_>) -> Result<RunOutcome> {
        let args = self.one_shot_args(request.prompt, request.model, request.thread_id);
        let command_line = format!("{} {}", self.settings.binary, args.join(" "));
        debug!(workspace = %request.workspace.display(), "Spawning agent");

        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(&args)
            .current_dir(request.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Callers enforce deadlines by dropping this future; the
            // child must not outlive it.
            .kill_on_drop(true);
        self.apply_env(&mut cmd);

        let mut child = cmd.spawn().with_context(|| {
            format!("failed to spawn agent binary '{}'", self.settings.binary)
        })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(s) = stdout_pipe.as_mut() {
                let _ = s.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(s) = stderr_pipe.as_mut() {
                let _ = s.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = match request.timeout {
            Some(timeout) => {
                tokio::select! {
                    status = child.wait() => status,
                    () = tokio::time::sleep(timeout) => {
                        warn!(timeout_secs = timeout.as_secs(), "Agent timed out; stopping");
                        stop_child(&mut child).await;
                        bail!(
                            "agent iteration timed out after {}s in {}",
                            timeout.as_secs(),
                            request.workspace.display()
                        );
                    }
                }
            }
            None => child.wait().await,
        };
        let exit = status
            .context("failed to await agent process")?
            .code()
            .unwrap_or(1);

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();
        let merged = merge_capped(&stdout_bytes, &stderr_bytes);

        // Redaction happens before the output reaches the parser, the
        // metrics bus, or any log.
        let output = self.redactor.redact(&merged);

        let mut telemetry = parse_output(&output);
        telemetry.exit = exit;

        let thread_id = extract_thread_id(&output);
        let awaiting_input = exit == 0
            && telemetry.tool_calls.is_empty()
            && super::contains_interactive_marker(&output);

        Ok(RunOutcome {
            success: exit == 0,
            exit,
            output,
            telemetry,
            awaiting_input,
            thread_id,
            command_line,
        })
    }

    /// Probe the agent's auth state with its whoami sub-command. Called
    /// once by the batch scheduler before any item starts.
    pub async fn validate_auth(&self) -> AuthStatus {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("whoami")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        self.apply_env(&mut cmd);

        let output = match tokio::time::timeout(AUTH_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return AuthStatus {
                    authenticated: false,
                    error: Some(format!(
                        "failed to run '{} whoami': {e}",
                        self.settings.binary
                    )),
                    suggestion: Some(
                        "install the agent CLI or point agent.binary at it".to_string(),
                    ),
                    has_credits: false,
                };
            }
            Err(_) => {
                return AuthStatus {
                    authenticated: false,
                    error: Some(format!(
                        "'{} whoami' timed out after {}s",
                        self.settings.binary,
                        AUTH_TIMEOUT.as_secs()
                    )),
                    suggestion: None,
                    has_credits: false,
                };
            }
        };

        let combined = self.redactor.redact(&format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ));
        let lower = combined.to_lowercase();

        if output.status.success() {
            let has_credits = !["no credits", "out of credits", "insufficient credits"]
                .iter()
                .any(|s| lower.contains(s));
            AuthStatus {
                authenticated: true,
                error: None,
                suggestion: (!has_credits)
                    .then(|| "add credits to your agent account".to_string()),
                has_credits,
            }
        } else {
            let suggestion = if lower.contains("not logged in")
                || lower.contains("unauthorized")
                || lower.contains("login")
            {
                Some(format!("run `{} login` to authenticate", self.settings.binary))
            } else {
                None
            };
            AuthStatus {
                authenticated: false,
                error: Some(combined.trim().to_string()),
                suggestion,
                has_credits: false,
            }
        }
    }
}

pub(crate) fn model_alias_flag(model: &str) -> Option<&'static str> {
    let model = model.trim().to_ascii_lowercase();
    MODEL_ALIAS_FLAGS
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, flag)| *flag)
}

/// Merge stdout and stderr with a hard cap; warn when truncating.
fn merge_capped(stdout: &[u8], stderr: &[u8]) -> String {
    let mut merged = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push_str(&stderr);
    }

    if merged.len() > MAX_CAPTURE_BYTES {
        warn!(
            captured = merged.len(),
            cap = MAX_CAPTURE_BYTES,
            "Agent output exceeded capture cap; truncating"
        );
        let mut cut = MAX_CAPTURE_BYTES;
        while !merged.is_char_boundary(cut) {
            cut -= 1;
        }
        merged.truncate(cut);
        merged.push_str("\n[output truncated]\n");
    }
    merged
}

fn extract_thread_id(output: &str) -> Option<String> {
    if let Some(caps) = THREAD_ID_JSON.captures(output) {
        return Some(caps[1].to_string());
    }
    THREAD_ID_TEXT
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Close down a live agent: terminate, wait out the grace period, kill.
pub(crate) async fn stop_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let mut system = sysinfo::System::new();
        let sys_pid = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);
        let terminated = system
            .process(sys_pid)
            .map(|p| p.kill_with(sysinfo::Signal::Term).unwrap_or(false))
            .unwrap_or(false);
        if terminated && tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
            info!("Agent exited after terminate");
            return;
        }
    }
    let _ = child.kill().await;
}
