//! Batch scheduler concurrency-cap test: at every sampled instant the
//! number of items in `running` stays within the plan bound.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conductor::batch::{BatchOptions, BatchPlan, BatchScheduler, PlanItem};
use conductor::config::Config;
use conductor::git::GitDriver;
use conductor::store::Store;
use conductor::types::{BatchDefaults, BatchItemStatus, BatchRunStatus};
use conductor::workspace::WorkspaceManager;
use tempfile::TempDir;

async fn build_manager(temp: &TempDir, agent_body: &str) -> (Arc<WorkspaceManager>, PathBuf) {
    let agent_path = temp.path().join("agent.sh");
    std::fs::write(&agent_path, format!("#!/bin/sh\n{agent_body}\n")).unwrap();
    let mut perms = std::fs::metadata(&agent_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&agent_path, perms).unwrap();

    let mut config = Config::default();
    config.agent.binary = agent_path.to_string_lossy().to_string();

    let state = temp.path().join("state");
    let store = Arc::new(Store::open(&state.join("sessions.sqlite3")).unwrap());
    let manager = Arc::new(
        WorkspaceManager::with_event_log(
            config,
            store,
            &state.join("events.jsonl"),
            state.join("locks"),
        )
        .unwrap(),
    );

    let git = GitDriver::new("git", Duration::from_secs(30));
    let repo = temp.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    git.run(&["init", "-b", "main"], &repo).await.unwrap();
    git.run(&["config", "user.email", "t@example.com"], &repo)
        .await
        .unwrap();
    git.run(&["config", "user.name", "tester"], &repo)
        .await
        .unwrap();
    std::fs::write(repo.join("README.md"), "# demo\n").unwrap();
    git.commit_all("initial", &repo).await.unwrap();

    (manager, repo)
}

#[tokio::test]
async fn test_concurrency_cap_holds_under_sampling() {
    let temp = TempDir::new().unwrap();
    // Each item's iteration is a controlled ~100 ms sleep.
    let (manager, repo) = build_manager(
        &temp,
        r#"case "$1" in
  whoami) echo ok; exit 0 ;;
esac
sleep 0.1
echo "done" > "out-$$.txt""#,
    )
    .await;

    let plan = BatchPlan {
        concurrency: 3,
        defaults: BatchDefaults::default(),
        matrix: (0..8)
            .map(|i| PlanItem {
                repo: repo.to_string_lossy().to_string(),
                prompt: format!("batch task {i}"),
                base_branch: None,
                script_command: None,
                model: None,
                timeout_sec: None,
                merge_on_pass: None,
            })
            .collect(),
    };

    let run_id = "cap-run".to_string();
    let store = manager.store().clone();

    let sampler = {
        let store = store.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move {
            let mut max_running = 0usize;
            loop {
                if let Ok(items) = store.batch_items(&run_id, None) {
                    if !items.is_empty() {
                        let running = items
                            .iter()
                            .filter(|i| i.status == BatchItemStatus::Running)
                            .count();
                        max_running = max_running.max(running);
                        if items.iter().all(|i| i.status.is_terminal()) {
                            break;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            max_running
        })
    };

    let scheduler = BatchScheduler::new(manager.clone());
    let summary = scheduler
        .execute(
            &plan,
            BatchOptions {
                run_id: Some(run_id.clone()),
                dry_run: false,
            },
        )
        .await
        .unwrap();

    let max_running = sampler.await.unwrap();

    assert_eq!(summary.total, 8);
    assert_eq!(summary.status, BatchRunStatus::Completed);
    assert_eq!(summary.succeeded, 8, "summary: {summary:?}");
    assert!(
        max_running <= 3,
        "in-flight count exceeded concurrency: {max_running}"
    );
    assert!(max_running >= 1, "sampler observed no running items");

    // Every item landed terminal with a session attached.
    let items = store.batch_items(&run_id, None).unwrap();
    assert_eq!(items.len(), 8);
    assert!(items.iter().all(|i| i.status.is_terminal()));
    assert!(items.iter().all(|i| i.session_id.is_some()));
}
