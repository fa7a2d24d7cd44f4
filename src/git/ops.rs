//! Mutating git operations: worktree lifecycle with two-phase rollback,
//! branch bookkeeping, and the squash/rebase/merge plumbing the merge
//! pipeline drives.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::driver::{GitDriver, GitError};

/// Ahead/behind counts relative to a base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub ahead: u32,
    pub behind: u32,
    /// Merge-base of HEAD and the base branch.
    pub branchpoint_sha: String,
}

/// Outcome of a rebase step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Ok,
    Conflict { files: Vec<String> },
}

impl RebaseOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Conflict { .. } => "conflict",
        }
    }
}

/// Entry from `git worktree list --porcelain`.
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: String,
    pub branch: Option<String>,
    pub head: Option<String>,
    pub bare: bool,
}

impl GitDriver {
    /// Create a branch from `base` and attach a worktree at `path`.
    ///
    /// Two-phase: any failure after the branch exists deletes the partial
    /// branch and directory. Transient failures retry up to three times
    /// with exponential backoff.
    #[instrument(skip(self), fields(repo = %repo.display(), branch, base))]
    pub async fn create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        path: &Path,
        base: &str,
    ) -> Result<(), GitError> {
        let _guard = self.path_guard(path).await;

        // Keep the base current when a remote exists; a stale base makes
        // the later merge-back needlessly conflict-prone.
        if self.has_remote(repo).await? {
            if let Err(e) = self.fetch(repo).await {
                warn!(error = %e, "Failed to fetch before worktree creation");
            }
        }

        if self.rev_parse(base, repo).await.is_err() {
            let origin_base = format!("origin/{base}");
            if self.rev_parse(&origin_base, repo).await.is_ok() {
                self.run_retry(&["branch", base, &origin_base], repo).await?;
            } else {
                return Err(GitError::CommandFailed {
                    command: format!("rev-parse --verify {base}"),
                    cwd: repo.to_path_buf(),
                    exit: 128,
                    stderr: format!("base branch '{base}' does not exist"),
                });
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_create_worktree(repo, branch, path, base).await {
                Ok(()) => {
                    info!(path = %path.display(), branch, "Worktree created");
                    return Ok(());
                }
                Err(e) => {
                    self.rollback_partial_worktree(repo, branch, path).await;
                    if attempt >= 3 || !e.is_transient() {
                        return Err(e);
                    }
                    let delay = Duration::from_secs(1 << (attempt - 1).min(3));
                    warn!(error = %e, attempt, retry_in = ?delay, "Worktree creation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        path: &Path,
        base: &str,
    ) -> Result<(), GitError> {
        if let Some(parent) = path.parent() {
            if let Err(source) = std::fs::create_dir_all(parent) {
                return Err(GitError::Spawn {
                    program: self.program().to_string(),
                    cwd: repo.to_path_buf(),
                    source,
                });
            }
            // Workspaces live inside the repository; keep them out of the
            // base checkout's status and stages.
            self.ensure_excluded(repo, parent);
        }

        self.run(&["branch", branch, base], repo).await?;

        let path_str = path.to_string_lossy();
        self.run(&["worktree", "add", &path_str, branch], repo)
            .await?;
        Ok(())
    }

    /// Add a repo-local ignore entry for a directory nested inside the
    /// repository, via `.git/info/exclude` so no tracked file changes.
    fn ensure_excluded(&self, repo: &Path, dir: &Path) {
        let Ok(rel) = dir.strip_prefix(repo) else {
            return;
        };
        if rel.as_os_str().is_empty() {
            return;
        }
        self.add_exclude_pattern(repo, &format!("/{}/", rel.to_string_lossy()));
    }

    /// Append a pattern to `.git/info/exclude` (shared across worktrees),
    /// if not already present.
    pub fn add_exclude_pattern(&self, repo: &Path, pattern: &str) {
        let exclude_path = repo.join(".git").join("info").join("exclude");

        let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
        if existing.lines().any(|line| line.trim() == pattern) {
            return;
        }
        if let Some(parent) = exclude_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(pattern);
        contents.push('\n');
        if let Err(e) = std::fs::write(&exclude_path, contents) {
            warn!(error = %e, "Failed to update .git/info/exclude");
        }
    }

    /// Best-effort removal of the partial branch and directory after a
    /// failed creation attempt.
    async fn rollback_partial_worktree(&self, repo: &Path, branch: &str, path: &Path) {
        // Only touch paths that are actually partial worktrees; a
        // pre-existing file or directory that blocked creation is not
        // ours to delete.
        if path.join(".git").exists() {
            let path_str = path.to_string_lossy();
            let _ = self
                .exec_raw(&["worktree", "remove", "--force", &path_str], repo, None)
                .await;
            if path.exists() {
                let _ = std::fs::remove_dir_all(path);
            }
        }
        let _ = self.exec_raw(&["worktree", "prune"], repo, None).await;
        let _ = self.exec_raw(&["branch", "-D", branch], repo, None).await;
    }

    /// Delete a worktree and its branch.
    ///
    /// The ordinary variant refuses unless the branch tip is reachable
    /// from `base` (i.e. already merged); `force` bypasses the check and
    /// removes any residual directory.
    #[instrument(skip(self), fields(repo = %repo.display(), branch, force))]
    pub async fn remove_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
        force: bool,
    ) -> Result<(), GitError> {
        let _guard = self.path_guard(path).await;

        if !force {
            let tip = self.rev_parse(branch, repo).await?;
            if !self.is_reachable_from(&tip, base, repo).await? {
                return Err(GitError::CommandFailed {
                    command: format!("worktree remove {}", path.display()),
                    cwd: repo.to_path_buf(),
                    exit: 1,
                    stderr: format!(
                        "branch '{branch}' is not reachable from base branch '{base}'; \
                         merge it first or use force"
                    ),
                });
            }
        }

        let path_str = path.to_string_lossy();
        if path.exists() {
            let mut args = vec!["worktree", "remove"];
            if force {
                args.push("--force");
            }
            args.push(&path_str);
            if let Err(e) = self.run(&args, repo).await {
                if !force {
                    return Err(e);
                }
                warn!(error = %e, "git worktree remove failed, deleting directory");
                let _ = std::fs::remove_dir_all(path);
            }
        }

        let _ = self.exec_raw(&["worktree", "prune"], repo, None).await;

        let delete_flag = if force { "-D" } else { "-d" };
        if let Err(e) = self.run(&["branch", delete_flag, branch], repo).await {
            if !force {
                return Err(e);
            }
            warn!(error = %e, branch, "Failed to delete branch");
        }

        info!(path = %path.display(), "Worktree removed");
        Ok(())
    }

    /// List all worktrees registered in the repository.
    pub async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let output = self
            .run(&["worktree", "list", "--porcelain"], repo)
            .await?;

        let mut entries = Vec::new();
        let mut current: Option<WorktreeEntry> = None;
        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                current = Some(WorktreeEntry {
                    path: path.to_string(),
                    branch: None,
                    head: None,
                    bare: false,
                });
            } else if let Some(ref mut entry) = current {
                if let Some(head) = line.strip_prefix("HEAD ") {
                    entry.head = Some(head.to_string());
                } else if let Some(branch) = line.strip_prefix("branch ") {
                    entry.branch = Some(
                        branch
                            .strip_prefix("refs/heads/")
                            .unwrap_or(branch)
                            .to_string(),
                    );
                } else if line == "bare" {
                    entry.bare = true;
                }
            }
        }
        if let Some(entry) = current {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Ahead/behind counts and the branchpoint relative to `base`.
    pub async fn branch_info(&self, cwd: &Path, base: &str) -> Result<BranchInfo, GitError> {
        let branchpoint_sha = self.run(&["merge-base", base, "HEAD"], cwd).await?;

        let range = format!("{base}...HEAD");
        let counts = self
            .run(&["rev-list", "--left-right", "--count", &range], cwd)
            .await?;
        let mut parts = counts.split_whitespace();
        let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        Ok(BranchInfo {
            ahead,
            behind,
            branchpoint_sha,
        })
    }

    /// Count commits since the branchpoint whose subject carries the
    /// agent-commit prefix.
    pub async fn agent_commits_count(
        &self,
        cwd: &Path,
        branchpoint: &str,
        prefix: &str,
    ) -> Result<u32, GitError> {
        let range = format!("{branchpoint}..HEAD");
        let subjects = self.run(&["log", "--format=%s", &range], cwd).await?;
        Ok(subjects
            .lines()
            .filter(|subject| subject.starts_with(prefix))
            .count() as u32)
    }

    /// True when there is no remote, or when `origin/<base>` carries no
    /// commits the local base lacks.
    pub async fn is_base_up_to_date(&self, cwd: &Path, base: &str) -> Result<bool, GitError> {
        if !self.has_remote(cwd).await? {
            return Ok(true);
        }
        let origin_base = format!("origin/{base}");
        if self.rev_parse(&origin_base, cwd).await.is_err() {
            return Ok(true);
        }
        let range = format!("{base}..{origin_base}");
        let count = self.run(&["rev-list", "--count", &range], cwd).await?;
        Ok(count.trim() == "0")
    }

    /// Soft-reset the current branch to `base` and commit the accumulated
    /// tree as a single commit. Returns the new SHA.
    ///
    /// `include_manual` is accepted for API stability; both modes produce
    /// the same squash.
    pub async fn squash_onto_base(
        &self,
        cwd: &Path,
        base: &str,
        message: &str,
        _include_manual: bool,
    ) -> Result<String, GitError> {
        self.run(&["reset", "--soft", base], cwd).await?;
        self.run_retry(&["commit", "-m", message], cwd).await?;
        self.head_commit(cwd).await
    }

    /// Rebase the current branch onto `base`, fetching first when a
    /// remote exists. Conflicts are a first-class outcome, not an error.
    pub async fn rebase_onto(&self, cwd: &Path, base: &str) -> Result<RebaseOutcome, GitError> {
        if self.has_remote(cwd).await? {
            if let Err(e) = self.fetch(cwd).await {
                warn!(error = %e, "Fetch before rebase failed");
            }
        }
        self.finish_rebase_step(cwd, &["rebase", base]).await
    }

    pub async fn continue_rebase(&self, cwd: &Path) -> Result<RebaseOutcome, GitError> {
        if !self.rebase_in_progress(cwd).await? {
            return Err(GitError::CommandFailed {
                command: "rebase --continue".to_string(),
                cwd: cwd.to_path_buf(),
                exit: 1,
                stderr: "no rebase in progress".to_string(),
            });
        }
        self.finish_rebase_step(cwd, &["rebase", "--continue"]).await
    }

    pub async fn abort_rebase(&self, cwd: &Path) -> Result<(), GitError> {
        if !self.rebase_in_progress(cwd).await? {
            return Err(GitError::CommandFailed {
                command: "rebase --abort".to_string(),
                cwd: cwd.to_path_buf(),
                exit: 1,
                stderr: "no rebase in progress".to_string(),
            });
        }
        self.run(&["rebase", "--abort"], cwd).await?;
        Ok(())
    }

    async fn finish_rebase_step(
        &self,
        cwd: &Path,
        args: &[&str],
    ) -> Result<RebaseOutcome, GitError> {
        let output = self.exec_raw(args, cwd, None).await?;
        if output.exit == 0 {
            return Ok(RebaseOutcome::Ok);
        }

        let files = self.unmerged_files(cwd).await?;
        if files.is_empty() && !self.rebase_in_progress(cwd).await? {
            // Failed outright rather than stopping on conflicts.
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                cwd: cwd.to_path_buf(),
                exit: output.exit,
                stderr: output.stderr.trim().to_string(),
            });
        }
        debug!(?files, "Rebase stopped on conflicts");
        Ok(RebaseOutcome::Conflict { files })
    }

    /// True iff a rebase is currently stopped in this checkout.
    pub async fn rebase_in_progress(&self, cwd: &Path) -> Result<bool, GitError> {
        for dir in ["rebase-merge", "rebase-apply"] {
            let marker = self.run(&["rev-parse", "--git-path", dir], cwd).await?;
            let path = PathBuf::from(&marker);
            let path = if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            };
            if path.exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Check out `base` in the main repository and merge `branch` into it.
    pub async fn fast_forward_merge(
        &self,
        repo: &Path,
        branch: &str,
        base: &str,
        no_ff: bool,
    ) -> Result<(), GitError> {
        self.run_retry(&["checkout", base], repo).await?;
        if no_ff {
            let message = format!("Merge branch '{branch}' into {base}");
            self.run_retry(&["merge", "--no-ff", "-m", &message, branch], repo)
                .await?;
        } else {
            self.run_retry(&["merge", "--ff-only", branch], repo).await?;
        }
        Ok(())
    }

    /// Write `format-patch -1 HEAD` to a file.
    pub async fn export_patch(&self, cwd: &Path, out_path: &Path) -> Result<(), GitError> {
        let output = self
            .exec(&["format-patch", "-1", "HEAD", "--stdout"], cwd, None)
            .await?;
        std::fs::write(out_path, output.stdout).map_err(|source| GitError::Spawn {
            program: "format-patch".to_string(),
            cwd: cwd.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// True iff `rev` is an ancestor of `base`.
    pub async fn is_reachable_from(
        &self,
        rev: &str,
        base: &str,
        cwd: &Path,
    ) -> Result<bool, GitError> {
        let output = self
            .exec_raw(&["merge-base", "--is-ancestor", rev, base], cwd, None)
            .await?;
        Ok(output.exit == 0)
    }
}
