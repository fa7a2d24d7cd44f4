//! AGENT_CONTEXT files staged in the workspace for the agent to read:
//! session metadata, the diff summary against the base branch, a running
//! iteration log, the last status snapshot, and rebase guidance while a
//! conflict is outstanding.
//!
//! All writers are idempotent; the iteration log is append-only.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::git::GitDriver;
use crate::types::Session;

pub const SESSION_FILE: &str = "SESSION.md";
pub const DIFF_SUMMARY_FILE: &str = "DIFF_SUMMARY.md";
pub const ITERATION_LOG_FILE: &str = "ITERATION_LOG.md";
pub const LAST_STATUS_FILE: &str = "LAST_STATUS.json";
pub const REBASE_HELP_FILE: &str = "REBASE_HELP.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastStatus {
    pub status: String,
    pub updated_at: String,
    pub last_commit: Option<String>,
}

fn context_dir(session: &Session) -> PathBuf {
    session.context_dir()
}

async fn ensure_dir(session: &Session) -> Result<PathBuf> {
    let dir = context_dir(session);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir)
}

/// Refresh SESSION.md and DIFF_SUMMARY.md from current git state.
pub async fn refresh(git: &GitDriver, session: &Session) -> Result<()> {
    let dir = ensure_dir(session).await?;

    let session_md = format!(
        "# Session: {name}\n\n\
         - id: {id}\n\
         - branch: `{branch}` (base: `{base}`)\n\
         - workspace: `{workspace}`\n\
         - mode: {mode}\n\
         - status: {status}\n\
         - created: {created}\n\n\
         ## Prompt\n\n{prompt}\n",
        name = session.name,
        id = session.id,
        branch = session.branch_name,
        base = session.base_branch,
        workspace = session.worktree_path.display(),
        mode = session.mode.as_str(),
        status = session.status.as_str(),
        created = session.created_at,
        prompt = session.prompt,
    );
    tokio::fs::write(dir.join(SESSION_FILE), session_md).await?;

    let diff_stat = git
        .run(
            &[
                "diff",
                "--no-color",
                "--stat",
                &format!("{}...HEAD", session.base_branch),
            ],
            &session.worktree_path,
        )
        .await
        .unwrap_or_default();
    let diff_md = if diff_stat.is_empty() {
        format!("# Diff vs {}\n\nNo changes yet.\n", session.base_branch)
    } else {
        format!("# Diff vs {}\n\n```\n{}\n```\n", session.base_branch, diff_stat)
    };
    tokio::fs::write(dir.join(DIFF_SUMMARY_FILE), diff_md).await?;

    Ok(())
}

/// Append one entry to the iteration log.
pub async fn append_iteration_log(session: &Session, entry: &str) -> Result<()> {
    let dir = ensure_dir(session).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(ITERATION_LOG_FILE))
        .await?;
    file.write_all(entry.as_bytes()).await?;
    if !entry.ends_with('\n') {
        file.write_all(b"\n").await?;
    }
    Ok(())
}

/// Overwrite the LAST_STATUS.json snapshot.
pub async fn write_last_status(session: &Session, last_commit: Option<&str>) -> Result<()> {
    let dir = ensure_dir(session).await?;
    let snapshot = LastStatus {
        status: session.status.as_str().to_string(),
        updated_at: crate::types::now_ts(),
        last_commit: last_commit.map(str::to_string),
    };
    let body = serde_json::to_string_pretty(&snapshot)?;
    tokio::fs::write(dir.join(LAST_STATUS_FILE), body).await?;
    Ok(())
}

/// Write the conflict guidance file listing unresolved paths.
pub async fn write_rebase_help(session: &Session, files: &[String]) -> Result<()> {
    let dir = ensure_dir(session).await?;
    let mut body = format!(
        "# Rebase conflicts\n\n\
         Rebasing `{}` onto `{}` stopped on conflicts.\n\n\
         ## Unresolved files\n\n",
        session.branch_name, session.base_branch
    );
    for file in files {
        body.push_str(&format!("- `{file}`\n"));
    }
    body.push_str(
        "\nResolve each file, stage the result, then continue the merge. \
         Aborting restores the branch to its pre-rebase state.\n",
    );
    tokio::fs::write(dir.join(REBASE_HELP_FILE), body).await?;
    Ok(())
}

/// Remove the guidance file once the rebase finishes or aborts.
pub async fn clear_rebase_help(session: &Session) -> Result<()> {
    let path = context_dir(session).join(REBASE_HELP_FILE);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn rebase_help_path(session: &Session) -> PathBuf {
    context_dir(session).join(REBASE_HELP_FILE)
}

/// The context directory itself must never leak into session commits.
pub fn is_context_path(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == "AGENT_CONTEXT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SessionMode, SessionStatus};
    use std::time::Duration;

    fn session_at(worktree: &Path) -> Session {
        Session {
            id: "s1".to_string(),
            name: "ctx test".to_string(),
            prompt: "write things".to_string(),
            repo_root: worktree.parent().unwrap().to_path_buf(),
            base_branch: "main".to_string(),
            branch_name: "amp/ctx-test/20250101000000".to_string(),
            worktree_path: worktree.to_path_buf(),
            status: SessionStatus::Idle,
            mode: SessionMode::Async,
            script_command: None,
            model_override: None,
            thread_id: None,
            created_at: crate::types::now_ts(),
            last_run_at: None,
            batch_run_id: None,
        }
    }

    #[tokio::test]
    async fn test_refresh_writes_session_and_diff() {
        let temp = tempfile::TempDir::new().unwrap();
        let wt = temp.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();

        let git = GitDriver::new("git", Duration::from_secs(30));
        git.run(&["init", "-b", "main"], &wt).await.unwrap();
        git.run(&["config", "user.email", "t@example.com"], &wt)
            .await
            .unwrap();
        git.run(&["config", "user.name", "t"], &wt).await.unwrap();
        std::fs::write(wt.join("a.txt"), "a\n").unwrap();
        git.commit_all("initial", &wt).await.unwrap();

        let session = session_at(&wt);
        refresh(&git, &session).await.unwrap();

        let session_md =
            std::fs::read_to_string(session.context_dir().join(SESSION_FILE)).unwrap();
        assert!(session_md.contains("ctx test"));
        assert!(session_md.contains("write things"));

        let diff_md =
            std::fs::read_to_string(session.context_dir().join(DIFF_SUMMARY_FILE)).unwrap();
        assert!(diff_md.contains("No changes yet"));

        // Idempotent.
        refresh(&git, &session).await.unwrap();
    }

    #[tokio::test]
    async fn test_iteration_log_appends() {
        let temp = tempfile::TempDir::new().unwrap();
        let wt = temp.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();
        let session = session_at(&wt);

        append_iteration_log(&session, "## iteration 1\nfirst").await.unwrap();
        append_iteration_log(&session, "## iteration 2\nsecond").await.unwrap();

        let log =
            std::fs::read_to_string(session.context_dir().join(ITERATION_LOG_FILE)).unwrap();
        assert!(log.contains("iteration 1"));
        assert!(log.contains("iteration 2"));
        let first = log.find("iteration 1").unwrap();
        let second = log.find("iteration 2").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_last_status_round_trips() {
        let temp = tempfile::TempDir::new().unwrap();
        let wt = temp.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();
        let session = session_at(&wt);

        write_last_status(&session, Some("abc123")).await.unwrap();
        let raw =
            std::fs::read_to_string(session.context_dir().join(LAST_STATUS_FILE)).unwrap();
        let parsed: LastStatus = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.status, "idle");
        assert_eq!(parsed.last_commit.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_rebase_help_lifecycle() {
        let temp = tempfile::TempDir::new().unwrap();
        let wt = temp.path().join("wt");
        std::fs::create_dir_all(&wt).unwrap();
        let session = session_at(&wt);

        write_rebase_help(&session, &["src/a.rs".to_string(), "b.txt".to_string()])
            .await
            .unwrap();
        let help = std::fs::read_to_string(rebase_help_path(&session)).unwrap();
        assert!(help.contains("src/a.rs"));
        assert!(help.contains("b.txt"));

        clear_rebase_help(&session).await.unwrap();
        assert!(!rebase_help_path(&session).exists());
        // Clearing twice is fine.
        clear_rebase_help(&session).await.unwrap();
    }

    #[test]
    fn test_is_context_path() {
        assert!(is_context_path(Path::new("AGENT_CONTEXT/SESSION.md")));
        assert!(!is_context_path(Path::new("src/main.rs")));
    }
}
