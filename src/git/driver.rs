use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Grace period between terminate and kill when a command times out.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Lock files under `.git/` older than this are presumed abandoned.
const STALE_LOCK_AGE: Duration = Duration::from_secs(300);

/// Retry schedule for transient failures: exponential from 1 s capped at
/// 10 s with jitter, three attempts total.
const RETRY_MIN_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const RETRY_MAX_TIMES: usize = 2;

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: i32,
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("`git {command}` timed out after {timeout_secs}s (cwd: {cwd})")]
    Timeout {
        command: String,
        cwd: PathBuf,
        timeout_secs: u64,
    },

    #[error("`git {command}` failed with exit {exit} (cwd: {cwd}): {stderr}")]
    CommandFailed {
        command: String,
        cwd: PathBuf,
        exit: i32,
        stderr: String,
    },

    #[error("failed to spawn `{program}` (cwd: {cwd}): {source}")]
    Spawn {
        program: String,
        cwd: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    /// True for failures worth retrying: lock contention, flaky network,
    /// busy devices, and worktree registration races.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Spawn { .. } => false,
            Self::CommandFailed { stderr, .. } => is_transient_message(stderr),
        }
    }
}

fn is_transient_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    const SIGNATURES: &[&str] = &[
        "index.lock",
        "head.lock",
        "config.lock",
        "cannot lock ref",
        "packed-refs",
        "another git process",
        "timed out",
        "connection refused",
        "connection reset",
        "could not resolve host",
        "network is unreachable",
        "device or resource busy",
        "resource busy",
        "already exists",
        "missing but already registered worktree",
    ];
    SIGNATURES.iter().any(|sig| msg.contains(sig))
}

/// Append an actionable hint for well-known fatal failures.
fn enrich_stderr(stderr: &str) -> String {
    const HINTS: &[(&str, &str)] = &[
        (
            "not a git repository",
            "the working directory is not inside a git repository",
        ),
        (
            "Permission denied",
            "check filesystem permissions for the repository",
        ),
        (
            "could not read config file",
            "the repository's git config is unreadable or missing",
        ),
    ];

    for (needle, hint) in HINTS {
        if stderr.contains(needle) {
            return format!("{} ({})", stderr.trim(), hint);
        }
    }
    stderr.trim().to_string()
}

/// Typed wrapper over a git executable. Cheap to clone; clones share
/// the per-path mutation locks.
#[derive(Debug, Clone)]
pub struct GitDriver {
    program: String,
    default_timeout: Duration,
    // git's worktree registry corrupts under concurrent add/remove of
    // the same path, so mutations take a per-path lock first.
    path_locks: Arc<DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitDriver {
    pub fn new(program: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            default_timeout,
            path_locks: Arc::new(DashMap::new()),
        }
    }

    /// Hold the mutation lock for a worktree path. The guard is owned so
    /// it can live across the whole create/remove sequence.
    pub(crate) async fn path_guard(&self, path: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .path_locks
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.git_executable(),
            Duration::from_secs(config.git.timeout_secs),
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Execute git, capturing output, without interpreting the exit code.
    ///
    /// On timeout the child receives a terminate signal, escalated to a
    /// kill after a grace period, and a `GitError::Timeout` is returned.
    pub async fn exec_raw(
        &self,
        args: &[&str],
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<GitOutput, GitError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!(?args, cwd = %cwd.display(), "Running git command");

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(cwd)
            // Never hang on credential prompts or editors.
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .env("EDITOR", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
            program: self.program.clone(),
            cwd: cwd.to_path_buf(),
            source,
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

        let mut timed_out = false;
        let status = tokio::select! {
            status = child.wait() => status,
            () = tokio::time::sleep(timeout) => {
                timed_out = true;
                terminate_then_kill(&mut child).await;
                child.wait().await
            }
        };

        if timed_out {
            return Err(GitError::Timeout {
                command: args.join(" "),
                cwd: cwd.to_path_buf(),
                timeout_secs: timeout.as_secs(),
            });
        }

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
            stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
            exit: status.ok().and_then(|s| s.code()).unwrap_or(1),
        })
    }

    /// Execute git and fail on non-zero exit, enriching the error with
    /// the command, working directory, and recognized failure hints.
    pub async fn exec(
        &self,
        args: &[&str],
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<GitOutput, GitError> {
        let output = self.exec_raw(args, cwd, timeout).await?;
        if output.exit != 0 {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                cwd: cwd.to_path_buf(),
                exit: output.exit,
                stderr: enrich_stderr(&output.stderr),
            });
        }
        Ok(output)
    }

    /// `exec` returning trimmed stdout.
    pub async fn run(&self, args: &[&str], cwd: &Path) -> Result<String, GitError> {
        Ok(self.exec(args, cwd, None).await?.stdout.trim().to_string())
    }

    /// `exec` with retry for transient failures. Between attempts, lock
    /// files abandoned under `.git/` are swept.
    pub async fn run_retry(&self, args: &[&str], cwd: &Path) -> Result<String, GitError> {
        let op = || async { self.run(args, cwd).await };
        op.retry(
            ExponentialBuilder::default()
                .with_min_delay(RETRY_MIN_DELAY)
                .with_max_delay(RETRY_MAX_DELAY)
                .with_max_times(RETRY_MAX_TIMES)
                .with_jitter(),
        )
        .when(GitError::is_transient)
        .notify(|err: &GitError, dur: Duration| {
            warn!(error = %err, retry_in = ?dur, "Transient git failure, retrying");
            let removed = clean_stale_git_locks(cwd);
            if removed > 0 {
                warn!(removed, "Removed stale git lock files");
            }
        })
        .await
    }

    // ─── Read-only queries ───────────────────────────────────────────────

    /// True iff the directory is inside a git work tree.
    #[instrument(skip(self), fields(cwd = %cwd.display()))]
    pub async fn is_repo(&self, cwd: &Path) -> bool {
        match self
            .exec_raw(&["rev-parse", "--is-inside-work-tree"], cwd, None)
            .await
        {
            Ok(out) => out.exit == 0,
            Err(_) => false,
        }
    }

    /// Current branch name.
    pub async fn current_branch(&self, cwd: &Path) -> Result<String, GitError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"], cwd).await
    }

    /// Default branch: `origin/HEAD` target if present, else the current
    /// branch, else the literal `main`.
    pub async fn default_branch(&self, cwd: &Path) -> String {
        if let Ok(head_ref) = self
            .run(&["symbolic-ref", "refs/remotes/origin/HEAD"], cwd)
            .await
        {
            if let Some(branch) = head_ref.strip_prefix("refs/remotes/origin/") {
                return branch.to_string();
            }
        }
        match self.current_branch(cwd).await {
            Ok(branch) if branch != "HEAD" => branch,
            _ => "main".to_string(),
        }
    }

    /// True iff the repository has at least one configured remote.
    pub async fn has_remote(&self, cwd: &Path) -> Result<bool, GitError> {
        Ok(!self.run(&["remote"], cwd).await?.is_empty())
    }

    pub async fn fetch(&self, cwd: &Path) -> Result<(), GitError> {
        self.run_retry(&["fetch", "origin"], cwd).await?;
        Ok(())
    }

    pub async fn rev_parse(&self, rev: &str, cwd: &Path) -> Result<String, GitError> {
        self.run(&["rev-parse", "--verify", rev], cwd).await
    }

    pub async fn head_commit(&self, cwd: &Path) -> Result<String, GitError> {
        self.run(&["rev-parse", "HEAD"], cwd).await
    }

    /// True iff porcelain status is non-empty.
    pub async fn has_changes(&self, cwd: &Path) -> Result<bool, GitError> {
        Ok(!self.run(&["status", "--porcelain"], cwd).await?.is_empty())
    }

    /// Relative paths of changed files, status markers stripped.
    pub async fn changed_files(&self, cwd: &Path) -> Result<Vec<String>, GitError> {
        let output = self.run(&["status", "--porcelain"], cwd).await?;
        Ok(output
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| {
                let path = &line[3..];
                // Renames are reported as "old -> new"; keep the new path.
                match path.split_once(" -> ") {
                    Some((_, new)) => new.to_string(),
                    None => path.to_string(),
                }
            })
            .collect())
    }

    /// Unified diff, no color. `rev` diffs against a base revision.
    pub async fn diff(&self, cwd: &Path, rev: Option<&str>) -> Result<String, GitError> {
        let mut args = vec!["diff", "--no-color"];
        if let Some(rev) = rev {
            args.push(rev);
        }
        Ok(self.exec(&args, cwd, None).await?.stdout)
    }

    /// Per-path (added, deleted) line counts for staged changes. Binary
    /// files report zero on both sides.
    pub async fn staged_numstat(&self, cwd: &Path) -> Result<Vec<(u32, u32, String)>, GitError> {
        let output = self.run(&["diff", "--cached", "--numstat"], cwd).await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\t');
                let added = parts.next()?.parse().unwrap_or(0);
                let deleted = parts.next()?.parse().unwrap_or(0);
                let path = parts.next()?.to_string();
                Some((added, deleted, path))
            })
            .collect())
    }

    /// Per-path status letter (A/M/D/…) for staged changes.
    pub async fn staged_name_status(&self, cwd: &Path) -> Result<Vec<(char, String)>, GitError> {
        let output = self
            .run(&["diff", "--cached", "--name-status"], cwd)
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, '\t');
                let status = parts.next()?.chars().next()?;
                let path = parts.next()?.to_string();
                Some((status, path))
            })
            .collect())
    }

    /// Stage everything and commit. Returns the new SHA, or None when
    /// there was nothing to commit.
    pub async fn commit_all(
        &self,
        message: &str,
        cwd: &Path,
    ) -> Result<Option<String>, GitError> {
        self.run_retry(&["add", "-A"], cwd).await?;

        let staged = self
            .exec_raw(&["diff", "--cached", "--quiet"], cwd, None)
            .await?;
        if staged.exit == 0 {
            return Ok(None);
        }

        self.run_retry(&["commit", "-m", message], cwd).await?;
        Ok(Some(self.head_commit(cwd).await?))
    }

    /// Paths still unresolved during a rebase or merge.
    pub async fn unmerged_files(&self, cwd: &Path) -> Result<Vec<String>, GitError> {
        let output = self
            .run(&["diff", "--name-only", "--diff-filter=U"], cwd)
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }
}

/// Send the polite signal first; fall back to SIGKILL after the grace
/// period or where terminate is unsupported.
async fn terminate_then_kill(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let mut system = sysinfo::System::new();
        let sys_pid = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);
        let terminated = system
            .process(sys_pid)
            .map(|p| p.kill_with(sysinfo::Signal::Term).unwrap_or(false))
            .unwrap_or(false);

        if terminated {
            let grace = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            if grace.is_ok() {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

/// Remove lock files under the repository's git dir whose mtime exceeds
/// the stale threshold. Returns the number removed.
fn clean_stale_git_locks(cwd: &Path) -> usize {
    let Some(git_dir) = resolve_git_dir(cwd) else {
        return 0;
    };
    let Ok(entries) = std::fs::read_dir(&git_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "lock") {
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| {
                    SystemTime::now()
                        .duration_since(mtime)
                        .map(|age| age > STALE_LOCK_AGE)
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if stale && std::fs::remove_file(&path).is_ok() {
                warn!(path = %path.display(), "Removed stale git lock file");
                removed += 1;
            }
        }
    }
    removed
}

/// Resolve `.git` for a checkout, following the `gitdir:` pointer that
/// worktrees use.
fn resolve_git_dir(cwd: &Path) -> Option<PathBuf> {
    let dot_git = cwd.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    if dot_git.is_file() {
        let contents = std::fs::read_to_string(&dot_git).ok()?;
        let target = contents.strip_prefix("gitdir:")?.trim();
        let path = PathBuf::from(target);
        let path = if path.is_absolute() {
            path
        } else {
            cwd.join(path)
        };
        return Some(path);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_message(
            "fatal: Unable to create '/repo/.git/index.lock': File exists"
        ));
        assert!(is_transient_message(
            "fatal: another git process seems to be running"
        ));
        assert!(is_transient_message("ssh: connect: Connection refused"));
        assert!(is_transient_message("worktree already exists"));
        assert!(!is_transient_message("fatal: not a git repository"));
        assert!(!is_transient_message("error: pathspec 'x' did not match"));
    }

    #[test]
    fn test_enrich_stderr_hints() {
        let enriched = enrich_stderr("fatal: not a git repository (or any parent)");
        assert!(enriched.contains("not inside a git repository"));

        let passthrough = enrich_stderr("error: something else\n");
        assert_eq!(passthrough, "error: something else");
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = GitError::CommandFailed {
            command: "rebase main".to_string(),
            cwd: PathBuf::from("/work/repo"),
            exit: 128,
            stderr: "boom".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("rebase main"));
        assert!(text.contains("/work/repo"));
        assert!(text.contains("128"));
    }

    #[tokio::test]
    async fn test_exec_raw_in_non_repo() {
        let temp = tempfile::TempDir::new().unwrap();
        let driver = GitDriver::new("git", Duration::from_secs(30));
        let out = driver
            .exec_raw(&["rev-parse", "--is-inside-work-tree"], temp.path(), None)
            .await
            .unwrap();
        assert_ne!(out.exit, 0);
        assert!(!driver.is_repo(temp.path()).await);
    }

    #[tokio::test]
    async fn test_init_and_query_repo() {
        let temp = tempfile::TempDir::new().unwrap();
        let driver = GitDriver::new("git", Duration::from_secs(30));

        driver.run(&["init", "-b", "main"], temp.path()).await.unwrap();
        driver
            .run(&["config", "user.email", "t@example.com"], temp.path())
            .await
            .unwrap();
        driver
            .run(&["config", "user.name", "t"], temp.path())
            .await
            .unwrap();

        assert!(driver.is_repo(temp.path()).await);
        assert!(!driver.has_changes(temp.path()).await.unwrap());

        std::fs::write(temp.path().join("a.txt"), "hello\n").unwrap();
        assert!(driver.has_changes(temp.path()).await.unwrap());
        assert_eq!(
            driver.changed_files(temp.path()).await.unwrap(),
            vec!["a.txt".to_string()]
        );

        let sha = driver
            .commit_all("initial", temp.path())
            .await
            .unwrap()
            .expect("should commit");
        assert_eq!(sha.len(), 40);

        // Second commit with no changes returns None.
        assert!(driver.commit_all("empty", temp.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_branch_without_remote() {
        let temp = tempfile::TempDir::new().unwrap();
        let driver = GitDriver::new("git", Duration::from_secs(30));
        driver
            .run(&["init", "-b", "trunk"], temp.path())
            .await
            .unwrap();
        assert_eq!(driver.default_branch(temp.path()).await, "trunk");
    }

    #[tokio::test]
    async fn test_path_guard_serializes_across_clones() {
        let driver = GitDriver::new("git", Duration::from_secs(30));
        let clone = driver.clone();
        let path = PathBuf::from("/tmp/contended-worktree");

        let held = driver.path_guard(&path).await;

        // A clone shares the lock registry, so the same path blocks.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), clone.path_guard(&path)).await;
        assert!(blocked.is_err(), "second guard should wait");

        // A different path does not contend.
        let other = tokio::time::timeout(
            Duration::from_millis(50),
            clone.path_guard(Path::new("/tmp/other-worktree")),
        )
        .await;
        assert!(other.is_ok());

        drop(held);
        let acquired =
            tokio::time::timeout(Duration::from_millis(200), clone.path_guard(&path)).await;
        assert!(acquired.is_ok(), "guard should be free after release");
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_error() {
        let temp = tempfile::TempDir::new().unwrap();
        // Stand in a blocking program for git so the tiny timeout fires.
        let driver = GitDriver::new("sleep", Duration::from_millis(200));
        let err = driver.exec_raw(&["5"], temp.path(), None).await.unwrap_err();
        assert!(matches!(err, GitError::Timeout { .. }), "got {err:?}");
    }
}
