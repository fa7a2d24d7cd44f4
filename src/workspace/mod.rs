//! Workspace manager: session lifecycle over an isolated git worktree,
//! composing the git driver, session lock, store, metrics bus, and agent
//! adapter.

pub mod context;
mod interactive;
mod iteration;
mod merge;

pub use interactive::InteractiveSession;
pub use iteration::ORACLE_GUIDANCE_PROMPT;
pub use merge::{MergeState, PreflightReport};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::agent::AgentAdapter;
use crate::config::Config;
use crate::git::GitDriver;
use crate::lock::SessionLock;
use crate::metrics::{EventBus, EventSink, JsonlSink, StoreSink};
use crate::store::Store;
use crate::types::{self, Session, SessionMode, SessionStatus};

/// Options for `create_session`.
#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    pub name: String,
    pub prompt: String,
    pub repo_root: PathBuf,
    /// Defaults to the repository's default branch.
    pub base_branch: Option<String>,
    pub mode: SessionMode,
    pub script_command: Option<String>,
    pub model_override: Option<String>,
    pub batch_run_id: Option<String>,
    /// Run one iteration as part of creation. Callers that set this must
    /// not iterate again for the same turn.
    pub initial_iteration: bool,
}

pub struct WorkspaceManager {
    pub(crate) config: Config,
    pub(crate) git: GitDriver,
    pub(crate) store: Arc<Store>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) adapter: AgentAdapter,
    pub(crate) lock: SessionLock,
    // Sinks are weakly held by the bus; the manager keeps them alive.
    _sinks: Vec<Arc<dyn EventSink>>,
}

impl WorkspaceManager {
    /// Standard construction: store + JSONL sinks registered on a fresh
    /// bus, locks under the config directory.
    pub fn new(config: Config, store: Arc<Store>) -> Result<Self> {
        let event_log = Config::events_dir().join("events.jsonl");
        Self::with_event_log(config, store, &event_log, Config::locks_dir())
    }

    /// Construction with explicit event-log and locks paths (tests, CLI
    /// overrides).
    pub fn with_event_log(
        config: Config,
        store: Arc<Store>,
        event_log: &std::path::Path,
        locks_dir: PathBuf,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new());

        let store_sink: Arc<dyn EventSink> = Arc::new(StoreSink::new(store.clone()));
        let jsonl_sink: Arc<dyn EventSink> = Arc::new(
            JsonlSink::open(event_log).context("Failed to open event log sink")?,
        );
        bus.register(&store_sink);
        bus.register(&jsonl_sink);

        let git = GitDriver::from_config(&config);
        let adapter = AgentAdapter::new(config.agent.clone());
        let lock = SessionLock::new(locks_dir);

        Ok(Self {
            config,
            git,
            store,
            bus,
            adapter,
            lock,
            _sinks: vec![store_sink, jsonl_sink],
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn adapter(&self) -> &AgentAdapter {
        &self.adapter
    }

    pub fn git(&self) -> &GitDriver {
        &self.git
    }

    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    /// Create a session: derive the branch and workspace, carve the
    /// worktree, persist the row, stage context files, and optionally run
    /// the first iteration.
    ///
    /// Filesystem and git refs have no shared transaction; any failure
    /// after partial creation rolls the worktree and branch back.
    #[instrument(skip(self, opts), fields(name = %opts.name))]
    pub async fn create_session(&self, opts: CreateSessionOptions) -> Result<Session> {
        let repo_root = opts
            .repo_root
            .canonicalize()
            .with_context(|| format!("repository path {} not found", opts.repo_root.display()))?;
        if !self.git.is_repo(&repo_root).await {
            bail!("{} is not a git repository", repo_root.display());
        }

        let base_branch = match &opts.base_branch {
            Some(base) => base.clone(),
            None => self.git.default_branch(&repo_root).await,
        };

        let id = types::new_id();
        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let branch_name = format!(
            "{}/{}/{}",
            self.config.session.branch_prefix,
            types::slugify(&opts.name),
            timestamp
        );
        let worktree_path = repo_root
            .join(&self.config.session.worktree_dir)
            .join(&id);

        self.git
            .create_worktree(&repo_root, &branch_name, &worktree_path, &base_branch)
            .await
            .context("Failed to create session worktree")?;

        // Keep agent context files out of commits in every checkout.
        self.git.add_exclude_pattern(&repo_root, "AGENT_CONTEXT/");

        let session = Session {
            id: id.clone(),
            name: opts.name,
            prompt: opts.prompt,
            repo_root: repo_root.clone(),
            base_branch,
            branch_name: branch_name.clone(),
            worktree_path: worktree_path.clone(),
            status: SessionStatus::Idle,
            mode: opts.mode,
            script_command: opts.script_command,
            model_override: opts.model_override,
            thread_id: None,
            created_at: types::now_ts(),
            last_run_at: None,
            batch_run_id: opts.batch_run_id,
        };

        if let Err(e) = self.store.insert_session(&session) {
            warn!(error = %e, "Session insert failed; rolling back worktree");
            let _ = self
                .git
                .remove_worktree(&repo_root, &worktree_path, &branch_name, &session.base_branch, true)
                .await;
            return Err(e).context("Failed to persist session");
        }

        if let Err(e) = context::refresh(&self.git, &session).await {
            warn!(error = %e, "Failed to stage initial context files");
        }

        info!(session = %session.id, branch = %branch_name, "Session created");

        if opts.initial_iteration {
            self.run_iteration(&session.id, None).await?;
            // Status and thread id may have moved.
            return Ok(self
                .store
                .get_session(&session.id)?
                .unwrap_or(session));
        }

        Ok(session)
    }

    /// Swap the agent binary after construction (test stubs).
    #[cfg(test)]
    pub(crate) fn set_agent_binary_for_tests(&mut self, binary: &str) {
        self.config.agent.binary = binary.to_string();
        self.adapter = AgentAdapter::new(self.config.agent.clone());
    }

    /// Load a session or fail with a caller error.
    pub(crate) fn require_session(&self, session_id: &str) -> Result<Session> {
        self.store
            .get_session(session_id)?
            .with_context(|| format!("unknown session id: {session_id}"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Build a manager over a throwaway config dir + store, plus an
    /// initialized git repo with one commit.
    pub(crate) async fn manager_with_repo(
        temp: &TempDir,
    ) -> (WorkspaceManager, PathBuf) {
        let mut config = Config::default();
        config.agent.binary = "false".to_string(); // never called unless a test opts in
        config.agent.env = HashMap::new();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = WorkspaceManager::with_event_log(
            config,
            store,
            &temp.path().join("state").join("events.jsonl"),
            temp.path().join("state").join("locks"),
        )
        .unwrap();

        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let git = manager.git().clone();
        git.run(&["init", "-b", "main"], &repo).await.unwrap();
        git.run(&["config", "user.email", "t@example.com"], &repo)
            .await
            .unwrap();
        git.run(&["config", "user.name", "t"], &repo).await.unwrap();
        std::fs::write(repo.join("README.md"), "# demo\n").unwrap();
        git.commit_all("initial", &repo).await.unwrap();
        std::fs::write(repo.join("lib.rs"), "fn lib() {}\n").unwrap();
        git.commit_all("second", &repo).await.unwrap();

        (manager, repo)
    }

    pub(crate) fn default_opts(repo: &std::path::Path, name: &str) -> CreateSessionOptions {
        CreateSessionOptions {
            name: name.to_string(),
            prompt: "add file X".to_string(),
            repo_root: repo.to_path_buf(),
            base_branch: None,
            mode: SessionMode::Async,
            script_command: None,
            model_override: None,
            batch_run_id: None,
            initial_iteration: false,
        }
    }

    #[tokio::test]
    async fn test_create_session_carves_worktree() {
        let temp = TempDir::new().unwrap();
        let (manager, repo) = manager_with_repo(&temp).await;

        let session = manager
            .create_session(default_opts(&repo, "Add login"))
            .await
            .unwrap();

        assert!(session.worktree_path.exists());
        assert!(manager.git().is_repo(&session.worktree_path).await);
        assert!(session.branch_name.starts_with("amp/add-login/"));
        assert_eq!(session.base_branch, "main");
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.context_dir().join("SESSION.md").exists());

        let stored = manager.store().get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.branch_name, session.branch_name);
    }

    #[tokio::test]
    async fn test_create_session_rejects_non_repo() {
        let temp = TempDir::new().unwrap();
        let (manager, _) = manager_with_repo(&temp).await;

        let plain = temp.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();
        let err = manager
            .create_session(default_opts(&plain, "nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }

    #[tokio::test]
    async fn test_two_sessions_same_repo_coexist() {
        let temp = TempDir::new().unwrap();
        let (manager, repo) = manager_with_repo(&temp).await;

        let a = manager
            .create_session(default_opts(&repo, "task a"))
            .await
            .unwrap();
        let b = manager
            .create_session(default_opts(&repo, "task b"))
            .await
            .unwrap();

        assert_ne!(a.worktree_path, b.worktree_path);
        assert_ne!(a.branch_name, b.branch_name);
        assert!(a.worktree_path.exists() && b.worktree_path.exists());
    }
}
