//! Merge pipeline: the state machine a session travels when folding its
//! work back into the base branch.
//!
//! States: `active` (no merge in progress) → `rebasing` (conflict
//! outstanding) → back to `active`, and finally `merged` once the tip is
//! reachable from base. At most one rebase is outstanding per session.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::context;
use super::WorkspaceManager;
use crate::git::RebaseOutcome;
use crate::types::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeState {
    Active,
    Rebasing,
    Merged,
}

/// Read-only readiness report for merging a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub repo_clean: bool,
    pub base_up_to_date: bool,
    pub tests_pass: Option<bool>,
    pub typecheck_passes: Option<bool>,
    pub ahead_by: u32,
    pub behind_by: u32,
    pub branchpoint_sha: String,
    pub agent_commits_count: u32,
    pub issues: Vec<String>,
}

impl WorkspaceManager {
    /// Current merge state of a session.
    pub async fn merge_state(&self, session_id: &str) -> Result<MergeState> {
        let session = self.require_session(session_id)?;
        if self.git.rebase_in_progress(&session.worktree_path).await? {
            return Ok(MergeState::Rebasing);
        }
        let tip = self.git.head_commit(&session.worktree_path).await?;
        if self
            .git
            .is_reachable_from(&tip, &session.base_branch, &session.worktree_path)
            .await?
        {
            return Ok(MergeState::Merged);
        }
        Ok(MergeState::Active)
    }

    /// Check merge readiness without mutating anything.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn preflight(&self, session_id: &str) -> Result<PreflightReport> {
        let session = self.require_session(session_id)?;
        let wt = &session.worktree_path;
        let mut issues = Vec::new();

        if self.git.rebase_in_progress(wt).await? {
            issues.push("a rebase is already in progress".to_string());
        }

        let repo_clean = !self.git.has_changes(wt).await?;
        if !repo_clean {
            issues.push("workspace has uncommitted changes".to_string());
        }

        if self.git.rev_parse(&session.base_branch, wt).await.is_err() {
            issues.push(format!("base branch '{}' does not exist", session.base_branch));
        }

        let base_up_to_date = self
            .git
            .is_base_up_to_date(wt, &session.base_branch)
            .await
            .unwrap_or(false);
        if !base_up_to_date {
            issues.push(format!(
                "base branch '{}' is behind its remote",
                session.base_branch
            ));
        }

        let info = self
            .git
            .branch_info(wt, &session.base_branch)
            .await
            .context("failed to compute branch info")?;
        let agent_commits_count = self
            .git
            .agent_commits_count(
                wt,
                &info.branchpoint_sha,
                &self.config.session.commit_prefix,
            )
            .await?;

        let tests_pass = match &session.script_command {
            Some(script) => {
                let pass = run_check(script, &session).await;
                if !pass {
                    issues.push(format!("test script failed: {script}"));
                }
                Some(pass)
            }
            None => None,
        };

        let typecheck_passes = match self.typecheck_command_for(&session) {
            Some(command) => {
                let pass = run_check(&command, &session).await;
                if !pass {
                    issues.push(format!("typecheck failed: {command}"));
                }
                Some(pass)
            }
            None => None,
        };

        Ok(PreflightReport {
            repo_clean,
            base_up_to_date,
            tests_pass,
            typecheck_passes,
            ahead_by: info.ahead,
            behind_by: info.behind,
            branchpoint_sha: info.branchpoint_sha,
            agent_commits_count,
            issues,
        })
    }

    /// Workspace-level typecheck applies only when the top-level package
    /// manifest declares workspaces.
    fn typecheck_command_for(&self, session: &Session) -> Option<String> {
        let command = self.config.session.typecheck_command.clone()?;
        let manifest = session.worktree_path.join("package.json");
        let contents = std::fs::read_to_string(manifest).ok()?;
        let parsed: serde_json::Value = serde_json::from_str(&contents).ok()?;
        parsed.get("workspaces").is_some().then_some(command)
    }

    /// Collapse the session's commits into a single commit on top of the
    /// base. `include_manual` is accepted but both modes squash
    /// identically.
    #[instrument(skip(self, message), fields(session = %session_id))]
    pub async fn squash_session(
        &self,
        session_id: &str,
        message: &str,
        include_manual: bool,
    ) -> Result<String> {
        let session = self.require_session(session_id)?;
        let guard = self.lock.acquire(session_id)?;

        let result = async {
            self.ensure_active(&session).await?;
            let sha = self
                .git
                .squash_onto_base(
                    &session.worktree_path,
                    &session.base_branch,
                    message,
                    include_manual,
                )
                .await?;
            info!(session = %session_id, sha = %sha, "Squashed session onto base");
            Ok(sha)
        }
        .await;

        drop(guard);
        result
    }

    /// Rebase onto the base branch. A conflict is a first-class result:
    /// guidance is written to the workspace and the session enters the
    /// `rebasing` state.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn rebase_onto_base(&self, session_id: &str) -> Result<RebaseOutcome> {
        let session = self.require_session(session_id)?;
        let guard = self.lock.acquire(session_id)?;

        let result = async {
            self.ensure_active(&session).await?;
            let outcome = self
                .git
                .rebase_onto(&session.worktree_path, &session.base_branch)
                .await?;
            self.record_rebase_outcome(&session, &outcome).await;
            Ok(outcome)
        }
        .await;

        drop(guard);
        result
    }

    /// Continue an outstanding rebase after conflicts were resolved.
    pub async fn continue_merge(&self, session_id: &str) -> Result<RebaseOutcome> {
        let session = self.require_session(session_id)?;
        let guard = self.lock.acquire(session_id)?;

        let result = async {
            let outcome = self.git.continue_rebase(&session.worktree_path).await?;
            self.record_rebase_outcome(&session, &outcome).await;
            Ok(outcome)
        }
        .await;

        drop(guard);
        result
    }

    /// Abort an outstanding rebase, restoring the pre-rebase branch.
    pub async fn abort_merge(&self, session_id: &str) -> Result<()> {
        let session = self.require_session(session_id)?;
        let guard = self.lock.acquire(session_id)?;

        let result = async {
            self.git.abort_rebase(&session.worktree_path).await?;
            if let Err(e) = context::clear_rebase_help(&session).await {
                warn!(error = %e, "Failed to clear rebase help file");
            }
            info!(session = %session_id, "Rebase aborted");
            Ok(())
        }
        .await;

        drop(guard);
        result
    }

    /// Merge the session branch into the base branch.
    #[instrument(skip(self), fields(session = %session_id))]
    pub async fn fast_forward_merge(&self, session_id: &str, no_ff: bool) -> Result<()> {
        let session = self.require_session(session_id)?;
        let guard = self.lock.acquire(session_id)?;

        let result = async {
            self.ensure_active(&session).await?;
            self.git
                .fast_forward_merge(
                    &session.repo_root,
                    &session.branch_name,
                    &session.base_branch,
                    no_ff,
                )
                .await?;
            info!(session = %session_id, "Merged into base");
            Ok(())
        }
        .await;

        drop(guard);
        result
    }

    /// Remove the workspace, branch, and store row. The non-force variant
    /// refuses while unmerged work exists. Calling cleanup again after
    /// success is a no-op.
    #[instrument(skip(self), fields(session = %session_id, force))]
    pub async fn cleanup(&self, session_id: &str, force: bool) -> Result<()> {
        let Some(session) = self.store.get_session(session_id)? else {
            // Already cleaned; best-effort on any filesystem residue.
            return Ok(());
        };
        let guard = self.lock.acquire(session_id)?;

        let result = async {
            self.git
                .remove_worktree(
                    &session.repo_root,
                    &session.worktree_path,
                    &session.branch_name,
                    &session.base_branch,
                    force,
                )
                .await?;
            self.store.delete_session(session_id)?;
            info!(session = %session_id, "Session cleaned up");
            Ok(())
        }
        .await;

        drop(guard);
        result
    }

    async fn ensure_active(&self, session: &Session) -> Result<()> {
        if self.git.rebase_in_progress(&session.worktree_path).await? {
            bail!(
                "session '{}' has a rebase in progress; continue or abort it first",
                session.id
            );
        }
        Ok(())
    }

    async fn record_rebase_outcome(&self, session: &Session, outcome: &RebaseOutcome) {
        match outcome {
            RebaseOutcome::Conflict { files } => {
                if let Err(e) = context::write_rebase_help(session, files).await {
                    warn!(error = %e, "Failed to write rebase help file");
                }
            }
            RebaseOutcome::Ok => {
                if let Err(e) = context::clear_rebase_help(session).await {
                    warn!(error = %e, "Failed to clear rebase help file");
                }
            }
        }
    }
}

async fn run_check(command: &str, session: &Session) -> bool {
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&session.worktree_path)
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(e) => {
            warn!(error = %e, command, "Failed to run preflight check");
            false
        }
    }
}
