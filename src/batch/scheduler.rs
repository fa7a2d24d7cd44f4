//! Batch scheduler: bounded-concurrency fan-out of plan items into
//! sessions, with an auth pre-flight gate, per-item timeout
//! classification, and cooperative abort.

use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use super::plan::{BatchPlan, ResolvedItem};
use crate::types::{
    BatchItem, BatchItemStatus, BatchRunStatus, SessionMode,
};
use crate::workspace::{CreateSessionOptions, WorkspaceManager};

/// Cooperative abort signal, polled by slot loops between items.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Explicit run identifier; fresh when absent.
    pub run_id: Option<String>,
    /// Print the resolved plan and stop before touching the store.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub run_id: String,
    pub status: BatchRunStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub errored: usize,
    pub dry_run: bool,
}

pub struct BatchScheduler {
    manager: Arc<WorkspaceManager>,
    abort: Arc<AtomicBool>,
}

impl BatchScheduler {
    pub fn new(manager: Arc<WorkspaceManager>) -> Self {
        Self {
            manager,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: self.abort.clone(),
        }
    }

    /// Execute a plan to completion (or abort).
    #[instrument(skip(self, plan, options))]
    pub async fn execute(&self, plan: &BatchPlan, options: BatchOptions) -> Result<BatchSummary> {
        plan.validate()?;
        let resolved = plan.resolved_items();

        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(crate::types::new_id);

        if options.dry_run {
            info!(run = %run_id, "Dry run; not executing");
            println!("{}", plan.summary());
            return Ok(BatchSummary {
                run_id,
                status: BatchRunStatus::Completed,
                total: resolved.len(),
                succeeded: 0,
                failed: 0,
                timed_out: 0,
                errored: 0,
                dry_run: true,
            });
        }

        let store = self.manager.store().clone();

        // Auth gate: no sessions are ever created for an unauthenticated
        // run; the plan is persisted with every item finalized as error
        // carrying the agent's message.
        let auth = self.manager.adapter().validate_auth().await;
        if !auth.authenticated || !auth.has_credits {
            let reason = if auth.authenticated {
                "agent account has no credits".to_string()
            } else {
                auth.error
                    .unwrap_or_else(|| "agent is not authenticated".to_string())
            };
            let message = match &auth.suggestion {
                Some(suggestion) => format!("{reason} ({suggestion})"),
                None => reason.clone(),
            };
            warn!(run = %run_id, error = %message, "Auth validation failed; failing run");

            store.insert_batch_run(&run_id, &plan.defaults, plan.concurrency)?;
            for item in &resolved {
                let now = crate::types::now_ts();
                store.insert_batch_item(&BatchItem {
                    id: crate::types::new_id(),
                    run_id: run_id.clone(),
                    repo_path: item.repo.clone(),
                    prompt: item.prompt.clone(),
                    status: BatchItemStatus::Error,
                    session_id: None,
                    started_at: None,
                    finished_at: Some(now),
                    commit_sha: None,
                    token_total: None,
                    tool_call_count: 0,
                    error: Some(message.clone()),
                })?;
            }
            store.update_batch_run_status(&run_id, BatchRunStatus::Error)?;
            bail!("batch auth validation failed: {message}");
        }

        store.insert_batch_run(&run_id, &plan.defaults, plan.concurrency)?;
        let mut queue_items = VecDeque::new();
        for item in resolved {
            let record = BatchItem {
                id: crate::types::new_id(),
                run_id: run_id.clone(),
                repo_path: item.repo.clone(),
                prompt: item.prompt.clone(),
                status: BatchItemStatus::Queued,
                session_id: None,
                started_at: None,
                finished_at: None,
                commit_sha: None,
                token_total: None,
                tool_call_count: 0,
                error: None,
            };
            store.insert_batch_item(&record)?;
            queue_items.push_back((record, item));
        }

        // Slot loops: each worker owns its current item exclusively and
        // is the only writer of its terminal status. Items start in plan
        // order; finishes land in any order.
        let queue = Arc::new(Mutex::new(queue_items));
        let slots = {
            let queued = queue.lock().expect("queue mutex poisoned");
            (plan.concurrency as usize).min(queued.len())
        };
        let mut workers = JoinSet::new();
        for slot in 0..slots {
            let queue = queue.clone();
            let manager = self.manager.clone();
            let abort = self.abort.clone();
            let run_id = run_id.clone();
            workers.spawn(async move {
                loop {
                    if abort.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = queue.lock().expect("queue mutex poisoned").pop_front();
                    let Some((record, item)) = next else {
                        break;
                    };
                    run_one_item(&manager, &run_id, record, item, slot).await;
                }
            });
        }
        while workers.join_next().await.is_some() {}

        let aborted = self.abort.load(Ordering::SeqCst);
        if aborted {
            // Anything still queued was skipped by its slot.
            for queued in store.batch_items(&run_id, Some(BatchItemStatus::Queued))? {
                let mut item = queued;
                item.status = BatchItemStatus::Error;
                item.error = Some("batch aborted".to_string());
                item.finished_at = Some(crate::types::now_ts());
                store.update_batch_item(&item)?;
            }
        }

        let final_status = if aborted {
            BatchRunStatus::Aborted
        } else {
            BatchRunStatus::Completed
        };
        store.update_batch_run_status(&run_id, final_status)?;

        let items = store.batch_items(&run_id, None)?;
        let count = |status: BatchItemStatus| {
            items.iter().filter(|i| i.status == status).count()
        };
        let summary = BatchSummary {
            run_id: run_id.clone(),
            status: final_status,
            total: items.len(),
            succeeded: count(BatchItemStatus::Success),
            failed: count(BatchItemStatus::Fail),
            timed_out: count(BatchItemStatus::Timeout),
            errored: count(BatchItemStatus::Error),
            dry_run: false,
        };
        info!(
            run = %run_id,
            status = %summary.status,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Batch run finished"
        );
        Ok(summary)
    }
}

/// Message fragments that classify a thrown error as a timeout.
fn is_timeout_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("timed out") || lower.contains("timeout")
}

async fn run_one_item(
    manager: &Arc<WorkspaceManager>,
    run_id: &str,
    mut record: BatchItem,
    item: ResolvedItem,
    slot: usize,
) {
    let store = manager.store().clone();
    info!(run = %run_id, item = %record.id, slot, repo = %item.repo, "Item starting");

    record.status = BatchItemStatus::Running;
    record.started_at = Some(crate::types::now_ts());
    if let Err(e) = store.update_batch_item(&record) {
        warn!(error = %e, "Failed to mark item running");
    }

    let attempts = item.retries + 1;
    let mut last_error: Option<(BatchItemStatus, String)> = None;

    for attempt in 1..=attempts {
        match run_item_session(manager, run_id, &record, &item).await {
            Ok(done) => {
                record = done;
                last_error = None;
                break;
            }
            Err(e) => {
                let message = format!("{e:#}");
                let status = if is_timeout_error(&message) {
                    BatchItemStatus::Timeout
                } else {
                    BatchItemStatus::Error
                };
                warn!(
                    item = %record.id,
                    attempt,
                    error = %message,
                    "Item attempt failed"
                );
                last_error = Some((status, message));
                if attempt < attempts {
                    continue;
                }
            }
        }
    }

    if let Some((status, message)) = last_error {
        record.status = status;
        record.error = Some(message);
    }
    record.finished_at = Some(crate::types::now_ts());
    if let Err(e) = store.update_batch_item(&record) {
        warn!(error = %e, "Failed to finalize batch item");
    }
    info!(item = %record.id, status = %record.status, "Item finished");
}

/// Create the item's session (which performs the one iteration itself;
/// iterating again here would double-run the agent) and fold the outcome
/// into the item record.
async fn run_item_session(
    manager: &Arc<WorkspaceManager>,
    run_id: &str,
    record: &BatchItem,
    item: &ResolvedItem,
) -> Result<BatchItem> {
    let opts = CreateSessionOptions {
        name: format!("batch-{}", &record.id[..8.min(record.id.len())]),
        prompt: item.prompt.clone(),
        repo_root: PathBuf::from(&item.repo),
        base_branch: item.base_branch.clone(),
        mode: SessionMode::Async,
        script_command: item.script_command.clone(),
        model_override: item.model.clone(),
        batch_run_id: Some(run_id.to_string()),
        initial_iteration: true,
    };

    let create = manager.create_session(opts);
    let session = match item.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, create).await {
            Ok(result) => result?,
            Err(_) => bail!(
                "batch item timed out after {}s in {}",
                timeout.as_secs(),
                item.repo
            ),
        },
        None => create.await?,
    };

    let store = manager.store().clone();
    let mut record = record.clone();
    record.session_id = Some(session.id.clone());

    let iterations = store.iterations_for(&session.id)?;
    let Some(iteration) = iterations.last() else {
        bail!("session '{}' finished without an iteration", session.id);
    };

    record.commit_sha = iteration.commit_sha.clone();
    record.token_total = iteration.total_tokens;
    record.tool_call_count = store
        .tool_calls_for(&session.id, Some(&iteration.id))?
        .len() as u32;

    let exit_ok = iteration.exit_code.unwrap_or(1) == 0;
    let tests_ok = iteration.test_result != Some(crate::types::TestResult::Fail);
    record.status = if exit_ok && tests_ok {
        BatchItemStatus::Success
    } else {
        BatchItemStatus::Fail
    };
    record.error = None;

    // Merge-on-pass is best-effort: merge errors are logged, never
    // propagated to the item.
    if item.merge_on_pass && record.status == BatchItemStatus::Success {
        if let Err(e) = merge_after_pass(manager, &session.id, &item.prompt).await {
            warn!(session = %session.id, error = %e, "merge-on-pass failed");
        }
    }

    Ok(record)
}

async fn merge_after_pass(
    manager: &Arc<WorkspaceManager>,
    session_id: &str,
    prompt: &str,
) -> Result<()> {
    let report = manager.preflight(session_id).await?;
    if !report.issues.is_empty() {
        bail!("preflight issues: {}", report.issues.join("; "));
    }
    let subject = prompt.lines().next().unwrap_or("batch change").trim();
    manager
        .squash_session(session_id, subject, false)
        .await?;
    let outcome = manager.rebase_onto_base(session_id).await?;
    if outcome != crate::git::RebaseOutcome::Ok {
        bail!("rebase stopped on conflicts");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(is_timeout_error("batch item timed out after 30s in /r"));
        assert!(is_timeout_error("deadline Timeout reached"));
        assert!(!is_timeout_error("agent exploded"));
    }

    #[cfg(unix)]
    mod execute_tests {
        use super::super::*;
        use crate::batch::plan::PlanItem;
        use crate::types::BatchDefaults;
        use crate::workspace::tests::manager_with_repo;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn install_stub_agent(dir: &std::path::Path, body: &str) -> String {
            let path = dir.join("batch-agent.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path.to_string_lossy().to_string()
        }

        fn plan_of(repo: &std::path::Path, n: usize, concurrency: u32) -> BatchPlan {
            BatchPlan {
                concurrency,
                defaults: BatchDefaults::default(),
                matrix: (0..n)
                    .map(|i| PlanItem {
                        repo: repo.to_string_lossy().to_string(),
                        prompt: format!("task {i}"),
                        base_branch: None,
                        script_command: None,
                        model: None,
                        timeout_sec: None,
                        merge_on_pass: None,
                    })
                    .collect(),
            }
        }

        /// Stub that succeeds quickly after writing a file; whoami also
        /// succeeds so the auth gate passes.
        const OK_AGENT: &str = r#"case "$1" in
  whoami) echo "user@example.com"; exit 0 ;;
esac
echo "batch output" > "batch-$$-$RANDOM.txt"
sleep 0.1
echo '{"tokens":{"prompt":5,"completion":5,"total":10},"model":"gpt-5"}'"#;

        #[tokio::test]
        async fn test_batch_completes_all_items() {
            let temp = TempDir::new().unwrap();
            let (mut manager, repo) = manager_with_repo(&temp).await;
            let stub = install_stub_agent(temp.path(), OK_AGENT);
            manager.set_agent_binary_for_tests(&stub);
            let manager = Arc::new(manager);

            let scheduler = BatchScheduler::new(manager.clone());
            let summary = scheduler
                .execute(&plan_of(&repo, 4, 2), BatchOptions::default())
                .await
                .unwrap();

            assert_eq!(summary.total, 4);
            assert_eq!(summary.succeeded, 4);
            assert_eq!(summary.status, BatchRunStatus::Completed);

            let items = manager
                .store()
                .batch_items(&summary.run_id, None)
                .unwrap();
            assert!(items.iter().all(|i| i.status.is_terminal()));
            assert!(items.iter().all(|i| i.session_id.is_some()));
            assert!(items.iter().all(|i| i.finished_at.is_some()));
            assert!(items.iter().all(|i| i.token_total == Some(10)));
        }

        #[tokio::test]
        async fn test_auth_failure_fails_whole_run() {
            let temp = TempDir::new().unwrap();
            let (mut manager, repo) = manager_with_repo(&temp).await;
            let stub = install_stub_agent(
                temp.path(),
                r#"echo "Error: not logged in" >&2; exit 1"#,
            );
            manager.set_agent_binary_for_tests(&stub);
            let manager = Arc::new(manager);

            let scheduler = BatchScheduler::new(manager.clone());
            let options = BatchOptions {
                run_id: Some("auth-run".to_string()),
                dry_run: false,
            };
            let err = scheduler
                .execute(&plan_of(&repo, 3, 2), options)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("auth validation failed"));

            // Zero sessions created; every item error with the message.
            assert!(manager.store().list_sessions().unwrap().is_empty());
            let items = manager.store().batch_items("auth-run", None).unwrap();
            assert_eq!(items.len(), 3);
            for item in &items {
                assert_eq!(item.status, BatchItemStatus::Error);
                assert!(item.error.as_deref().unwrap().contains("not logged in"));
                assert!(item.session_id.is_none());
            }
            let run = manager.store().get_batch_run("auth-run").unwrap().unwrap();
            assert_eq!(run.status, BatchRunStatus::Error);
        }

        #[tokio::test]
        async fn test_item_timeout_classification() {
            let temp = TempDir::new().unwrap();
            let (mut manager, repo) = manager_with_repo(&temp).await;
            let stub = install_stub_agent(
                temp.path(),
                r#"case "$1" in
  whoami) echo ok; exit 0 ;;
esac
sleep 30"#,
            );
            manager.set_agent_binary_for_tests(&stub);
            let manager = Arc::new(manager);

            let mut plan = plan_of(&repo, 1, 1);
            plan.matrix[0].timeout_sec = Some(1);
            let scheduler = BatchScheduler::new(manager.clone());
            let summary = scheduler
                .execute(&plan, BatchOptions::default())
                .await
                .unwrap();

            assert_eq!(summary.timed_out, 1);
            let items = manager
                .store()
                .batch_items(&summary.run_id, None)
                .unwrap();
            assert_eq!(items[0].status, BatchItemStatus::Timeout);
        }

        #[tokio::test]
        async fn test_concurrency_one_runs_in_plan_order() {
            let temp = TempDir::new().unwrap();
            let (mut manager, repo) = manager_with_repo(&temp).await;
            let stub = install_stub_agent(temp.path(), OK_AGENT);
            manager.set_agent_binary_for_tests(&stub);
            let manager = Arc::new(manager);

            let scheduler = BatchScheduler::new(manager.clone());
            let summary = scheduler
                .execute(&plan_of(&repo, 3, 1), BatchOptions::default())
                .await
                .unwrap();

            assert_eq!(summary.succeeded, 3);
            let items = manager
                .store()
                .batch_items(&summary.run_id, None)
                .unwrap();
            // With one slot, items start strictly in plan order.
            let starts: Vec<String> =
                items.iter().map(|i| i.started_at.clone().unwrap()).collect();
            let mut sorted = starts.clone();
            sorted.sort();
            assert_eq!(starts, sorted);
        }

        #[tokio::test]
        async fn test_abort_skips_queued_items() {
            let temp = TempDir::new().unwrap();
            let (mut manager, repo) = manager_with_repo(&temp).await;
            let stub = install_stub_agent(
                temp.path(),
                r#"case "$1" in
  whoami) echo ok; exit 0 ;;
esac
sleep 0.5
echo done"#,
            );
            manager.set_agent_binary_for_tests(&stub);
            let manager = Arc::new(manager);

            let scheduler = BatchScheduler::new(manager.clone());
            let handle = scheduler.abort_handle();
            let options = BatchOptions {
                run_id: Some("abort-run".to_string()),
                dry_run: false,
            };

            let aborter = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                handle.abort();
            });
            let summary = scheduler
                .execute(&plan_of(&repo, 6, 1), options)
                .await
                .unwrap();
            aborter.await.unwrap();

            assert_eq!(summary.status, BatchRunStatus::Aborted);
            let items = manager.store().batch_items("abort-run", None).unwrap();
            // In-flight items completed; the rest were marked aborted.
            let aborted: Vec<_> = items
                .iter()
                .filter(|i| i.error.as_deref() == Some("batch aborted"))
                .collect();
            assert!(!aborted.is_empty(), "queued items should be aborted");
            assert!(items.iter().all(|i| i.status.is_terminal()));
        }

        #[tokio::test]
        async fn test_dry_run_touches_nothing() {
            let temp = TempDir::new().unwrap();
            let (manager, repo) = manager_with_repo(&temp).await;
            let manager = Arc::new(manager);

            let scheduler = BatchScheduler::new(manager.clone());
            let options = BatchOptions {
                run_id: Some("dry".to_string()),
                dry_run: true,
            };
            let summary = scheduler
                .execute(&plan_of(&repo, 2, 1), options)
                .await
                .unwrap();

            assert!(summary.dry_run);
            assert!(manager.store().get_batch_run("dry").unwrap().is_none());
            assert!(manager.store().list_sessions().unwrap().is_empty());
        }
    }
}
