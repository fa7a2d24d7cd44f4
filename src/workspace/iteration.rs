//! Iteration engine: one agent turn within a session, run under the
//! session's cross-process lock.
//!
//! Event ordering within a turn is fixed: iteration_start, user_message,
//! file_edit (per path), test_result, llm_usage, tool_call (per call),
//! iteration_end. The store sink persists each event before publish
//! returns, so `iteration_end` is always the last write for the turn.

use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::context;
use super::WorkspaceManager;
use crate::agent::RunRequest;
use crate::metrics::{EventKind, FileOperation, IterationOutcome, MetricsEvent};
use crate::types::{Iteration, Session, SessionStatus, TestResult};

/// Output phrase with which the agent asks for a second-opinion pass.
/// Matched case-insensitively; kept pluggable through `requests_oracle`.
const ORACLE_MARKER: &str = "consult the oracle";

/// Prompt driving the informational oracle follow-up call.
pub const ORACLE_GUIDANCE_PROMPT: &str = "Review the work done so far in this workspace. \
     Point out design risks, missed edge cases, and anything that should \
     change before the next turn. Do not modify any files.";

/// Default predicate for oracle consultation requests.
fn requests_oracle(output: &str) -> bool {
    output.to_lowercase().contains(ORACLE_MARKER)
}

impl WorkspaceManager {
    /// Execute one turn of a session. `notes` are follow-up instructions;
    /// absent, the session's initial prompt drives the turn.
    #[instrument(skip(self, notes), fields(session = %session_id))]
    pub async fn run_iteration(
        &self,
        session_id: &str,
        notes: Option<&str>,
    ) -> Result<Iteration> {
        let mut session = self.require_session(session_id)?;

        let guard = self
            .lock
            .acquire(session_id)
            .context("session is busy in another process")?;

        let result = self.iterate_locked(&mut session, notes).await;

        // Lock released on every path; the guard also covers panics.
        drop(guard);

        if result.is_err() {
            let _ = self
                .store
                .update_session_status(session_id, SessionStatus::Error);
        }
        result
    }

    async fn iterate_locked(
        &self,
        session: &mut Session,
        notes: Option<&str>,
    ) -> Result<Iteration> {
        let started = Utc::now();
        session.status = SessionStatus::Running;
        self.store
            .update_session_status(&session.id, SessionStatus::Running)?;

        // 1. Stage context for the agent.
        context::refresh(&self.git, session).await?;

        // 2. Open the iteration record.
        let sequence = self.store.iterations_for(&session.id)?.len() as u32 + 1;
        let sha_before = self.git.head_commit(&session.worktree_path).await.ok();
        let mut iteration = Iteration::new(&session.id);
        self.store.insert_iteration(&iteration)?;
        self.publish(
            session,
            &iteration,
            EventKind::IterationStart {
                sequence,
                sha_before: sha_before.clone(),
            },
        );

        // 3. The driving prompt: follow-up notes win over the initial
        // prompt.
        let prompt = notes.unwrap_or(&session.prompt).to_string();
        self.publish(
            session,
            &iteration,
            EventKind::UserMessage {
                text: prompt.clone(),
            },
        );

        // 4. One agent turn.
        let run = self
            .adapter
            .run_iteration(RunRequest {
                prompt: &prompt,
                workspace: &session.worktree_path,
                model: session.model_override.as_deref(),
                thread_id: session.thread_id.as_deref(),
                timeout: None,
            })
            .await;

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(e) => {
                // The iteration row survives the failure, with the error
                // text in place of output.
                iteration.exit_code = Some(-1);
                iteration.output = Some(format!("agent invocation failed: {e}"));
                let _ = self.store.update_iteration(&iteration);
                self.publish(
                    session,
                    &iteration,
                    EventKind::IterationEnd {
                        outcome: IterationOutcome::Failed,
                        duration_ms: elapsed_ms(started),
                        exit_code: -1,
                    },
                );
                return Err(e);
            }
        };

        // 5. Informational oracle pass.
        if requests_oracle(&outcome.output) {
            info!(session = %session.id, "Agent requested oracle consultation");
            match self
                .adapter
                .run_iteration(RunRequest {
                    prompt: ORACLE_GUIDANCE_PROMPT,
                    workspace: &session.worktree_path,
                    model: session.model_override.as_deref(),
                    thread_id: outcome.thread_id.as_deref().or(session.thread_id.as_deref()),
                    timeout: Some(Duration::from_secs(300)),
                })
                .await
            {
                Ok(oracle) => {
                    let entry = format!(
                        "## Oracle consultation ({})\n\n{}\n",
                        crate::types::now_ts(),
                        oracle.output.trim()
                    );
                    if let Err(e) = context::append_iteration_log(session, &entry).await {
                        warn!(error = %e, "Failed to append oracle log");
                    }
                }
                Err(e) => warn!(error = %e, "Oracle consultation failed"),
            }
        }

        // 6. Tentative final status.
        let mut final_status = if outcome.awaiting_input {
            SessionStatus::AwaitingInput
        } else if outcome.exit != 0 {
            SessionStatus::Error
        } else {
            SessionStatus::Idle
        };

        // 7. Detect, stage, and commit repository changes. A non-empty
        // diff invalidates the adapter's awaiting-input reading: the
        // agent did real work and merely phrased a question at the end.
        let mut commit_sha = None;
        if self.git.has_changes(&session.worktree_path).await? {
            if final_status == SessionStatus::AwaitingInput && outcome.awaiting_input {
                final_status = SessionStatus::Idle;
            }
            self.git
                .run_retry(&["add", "-A"], &session.worktree_path)
                .await?;

            let numstat = self.git.staged_numstat(&session.worktree_path).await?;
            let name_status = self.git.staged_name_status(&session.worktree_path).await?;
            for (added, deleted, path) in &numstat {
                let operation = name_status
                    .iter()
                    .find(|(_, p)| p == path)
                    .map(|(status, _)| match status {
                        'A' => FileOperation::Create,
                        'D' => FileOperation::Delete,
                        _ => FileOperation::Modify,
                    })
                    .unwrap_or(FileOperation::Modify);
                self.publish(
                    session,
                    &iteration,
                    EventKind::FileEdit {
                        path: path.clone(),
                        lines_added: *added,
                        lines_deleted: *deleted,
                        operation,
                        diff: None,
                    },
                );
            }
            iteration.changed_files = numstat.len() as u32;

            let subject = commit_subject(&self.config.session.commit_prefix, &prompt);
            self.git
                .run_retry(&["commit", "-m", &subject], &session.worktree_path)
                .await?;
            let sha = self.git.head_commit(&session.worktree_path).await?;
            info!(session = %session.id, sha = %sha, "Committed agent changes");
            commit_sha = Some(sha);
        }
        iteration.commit_sha = commit_sha.clone();

        // 8. Test script, only after a commit.
        if let (Some(script), Some(_)) = (&session.script_command, &commit_sha) {
            let test_started = Utc::now();
            let test = run_script(script, session).await;
            let duration_ms = elapsed_ms(test_started);

            let test_result = if test.exit == 0 {
                TestResult::Pass
            } else {
                TestResult::Fail
            };
            iteration.test_result = Some(test_result);
            if test_result == TestResult::Fail {
                // Failing tests hand the session back to the user.
                final_status = SessionStatus::AwaitingInput;
            }
            self.publish(
                session,
                &iteration,
                EventKind::TestResult {
                    framework: "script".to_string(),
                    command: script.clone(),
                    total: 0,
                    passed: 0,
                    failed: u32::from(test.exit != 0),
                    skipped: 0,
                    duration_ms,
                    exit: test.exit,
                },
            );
        }

        // 9. Telemetry-derived events.
        let telemetry = &outcome.telemetry;
        if let (Some(total), Some(model)) = (telemetry.total_tokens, telemetry.model.as_deref()) {
            let cost_usd = crate::pricing::cost_usd(
                model,
                telemetry.prompt_tokens.unwrap_or(0),
                telemetry.completion_tokens.unwrap_or(0),
            );
            self.publish(
                session,
                &iteration,
                EventKind::LlmUsage {
                    model: model.to_string(),
                    prompt_tokens: telemetry.prompt_tokens,
                    completion_tokens: telemetry.completion_tokens,
                    total_tokens: Some(total),
                    cost_usd,
                    latency_ms: Some(elapsed_ms(started)),
                },
            );
        }
        for call in &telemetry.tool_calls {
            self.publish(
                session,
                &iteration,
                EventKind::ToolCall {
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    success: call.success,
                    duration_ms: call.duration_ms,
                    started_at: call.timestamp.map(crate::types::format_ts),
                    ended_at: None,
                },
            );
        }

        // 10. Persist engine-owned fields, then close via iteration_end.
        iteration.prompt_tokens = telemetry.prompt_tokens;
        iteration.completion_tokens = telemetry.completion_tokens;
        iteration.total_tokens = telemetry.total_tokens;
        iteration.model = telemetry.model.clone();
        iteration.agent_version = telemetry.agent_version.clone();
        iteration.exit_code = Some(outcome.exit);
        iteration.command_line = Some(outcome.command_line.clone());
        iteration.output = Some(outcome.output.clone());
        self.store.update_iteration(&iteration)?;

        let end_outcome = match final_status {
            SessionStatus::AwaitingInput => IterationOutcome::AwaitingInput,
            SessionStatus::Error => IterationOutcome::Failed,
            _ => IterationOutcome::Success,
        };
        self.publish(
            session,
            &iteration,
            EventKind::IterationEnd {
                outcome: end_outcome,
                duration_ms: elapsed_ms(started),
                exit_code: outcome.exit,
            },
        );

        self.store
            .update_session_status(&session.id, final_status)?;
        self.store.touch_session_last_run(&session.id)?;
        session.status = final_status;

        if let Some(notes) = notes {
            self.store.add_follow_up_prompt(&session.id, notes)?;
        }

        // 11. New thread id reported by the agent.
        if let Some(thread_id) = &outcome.thread_id {
            if session.thread_id.as_deref() != Some(thread_id) {
                self.store.set_session_thread(&session.id, thread_id)?;
                session.thread_id = Some(thread_id.clone());
            }
        }

        // Refresh on-disk context to the post-turn state.
        if let Err(e) = context::write_last_status(session, commit_sha.as_deref()).await {
            warn!(error = %e, "Failed to write LAST_STATUS.json");
        }
        let log_entry = format!(
            "## Iteration {} ({})\n- exit: {}\n- commit: {}\n- files changed: {}\n",
            sequence,
            iteration.started_at,
            outcome.exit,
            commit_sha.as_deref().unwrap_or("none"),
            iteration.changed_files,
        );
        if let Err(e) = context::append_iteration_log(session, &log_entry).await {
            warn!(error = %e, "Failed to append iteration log");
        }
        if let Err(e) = context::refresh(&self.git, session).await {
            warn!(error = %e, "Failed to refresh context files");
        }

        // Hand back the closed record.
        Ok(self
            .store
            .get_iteration(&iteration.id)?
            .unwrap_or(iteration))
    }

    fn publish(&self, session: &Session, iteration: &Iteration, kind: EventKind) {
        self.bus.publish(&MetricsEvent::new(
            &session.id,
            Some(&iteration.id),
            kind,
        ));
    }
}

fn elapsed_ms(since: chrono::DateTime<Utc>) -> u64 {
    (Utc::now() - since).num_milliseconds().max(0) as u64
}

/// Canonical agent-commit subject: prefix + first prompt line, bounded.
fn commit_subject(prefix: &str, prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("changes").trim();
    let mut subject = format!("{prefix} {first_line}");
    if subject.len() > 72 {
        let mut cut = 72;
        while !subject.is_char_boundary(cut) {
            cut -= 1;
        }
        subject.truncate(cut);
    }
    subject
}

struct ScriptOutput {
    exit: i32,
}

/// Run the session's test script with stdout/stderr merged into the
/// iteration log.
async fn run_script(script: &str, session: &Session) -> ScriptOutput {
    let result = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(&session.worktree_path)
        .output()
        .await;

    match result {
        Ok(output) => {
            let merged = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let exit = output.status.code().unwrap_or(1);
            let entry = format!(
                "### Test script (`{script}`) exit {exit}\n```\n{}\n```\n",
                merged.trim()
            );
            if let Err(e) = context::append_iteration_log(session, &entry).await {
                warn!(error = %e, "Failed to log test output");
            }
            ScriptOutput { exit }
        }
        Err(e) => {
            warn!(error = %e, "Failed to run test script");
            ScriptOutput { exit: 1 }
        }
    }
}
