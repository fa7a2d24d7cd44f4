//! Cross-process session lock.
//!
//! A lock is a JSON file under `<config-dir>/locks/<session-id>.lock`
//! created atomically. Stale locks (owner pid no longer alive) are
//! detected with a process-table probe and removed before acquisition.
//! Cooperative within a process, mandatory across processes: every
//! workspace-mutating operation runs under the session's lock.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("session '{session_id}' is already locked by pid {owner_pid}")]
    AlreadyLocked { session_id: String, owner_pid: u32 },

    #[error("lock io failure for session '{session_id}': {source}")]
    Io {
        session_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk lock payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub session_id: String,
    pub pid: u32,
    pub created_ts: String,
    pub hostname: String,
}

/// RAII guard; releasing happens on drop on every exit path, including
/// panics.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    session_id: String,
    released: bool,
}

impl LockGuard {
    /// Explicit release; drop does the same.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Releasing someone else's lock is a bug upstream; warn but still
        // remove so the session does not wedge.
        match read_lock_file(&self.path) {
            Ok(Some(existing)) if existing.pid != std::process::id() => {
                warn!(
                    session = %self.session_id,
                    owner_pid = existing.pid,
                    "Releasing a lock owned by a different pid"
                );
            }
            _ => {}
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session = %self.session_id, error = %e, "Failed to remove lock file");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// File-based session mutex keyed by session id.
#[derive(Debug, Clone)]
pub struct SessionLock {
    locks_dir: PathBuf,
}

impl SessionLock {
    pub fn new(locks_dir: PathBuf) -> Self {
        Self { locks_dir }
    }

    pub fn lock_path(&self, session_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{session_id}.lock"))
    }

    /// Acquire the lock for a session, or fail with `AlreadyLocked`.
    ///
    /// A pre-existing lock whose owner pid is dead (or whose payload is
    /// unreadable) counts as stale and is removed first.
    pub fn acquire(&self, session_id: &str) -> Result<LockGuard, LockError> {
        std::fs::create_dir_all(&self.locks_dir).map_err(|source| LockError::Io {
            session_id: session_id.to_string(),
            source,
        })?;

        let path = self.lock_path(session_id);
        self.reap_if_stale(&path);

        let payload = LockFile {
            session_id: session_id.to_string(),
            pid: std::process::id(),
            created_ts: crate::types::now_ts(),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        };

        // create_new is the atomic create-or-fail primitive.
        let file = OpenOptions::new().write(true).create_new(true).open(&path);
        match file {
            Ok(mut f) => {
                let body = serde_json::to_string(&payload).unwrap_or_default();
                f.write_all(body.as_bytes())
                    .map_err(|source| LockError::Io {
                        session_id: session_id.to_string(),
                        source,
                    })?;
                debug!(session = %session_id, "Acquired session lock");
                Ok(LockGuard {
                    path,
                    session_id: session_id.to_string(),
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner_pid = read_lock_file(&path)
                    .ok()
                    .flatten()
                    .map(|l| l.pid)
                    .unwrap_or(0);
                Err(LockError::AlreadyLocked {
                    session_id: session_id.to_string(),
                    owner_pid,
                })
            }
            Err(source) => Err(LockError::Io {
                session_id: session_id.to_string(),
                source,
            }),
        }
    }

    /// Run `f` under the session lock; the lock is released on every exit
    /// path (success, error, panic) via the guard's destructor.
    pub async fn with_lock<T, F, Fut>(&self, session_id: &str, f: F) -> Result<T, anyhow::Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
    {
        let guard = self.acquire(session_id)?;
        let result = f().await;
        guard.release();
        result
    }

    /// Remove the lock if its owner is gone or its payload unreadable.
    fn reap_if_stale(&self, path: &Path) {
        match read_lock_file(path) {
            Ok(Some(existing)) => {
                if !is_pid_alive(existing.pid) {
                    warn!(
                        session = %existing.session_id,
                        owner_pid = existing.pid,
                        "Removing stale lock (owner pid not alive)"
                    );
                    let _ = std::fs::remove_file(path);
                }
            }
            Ok(None) => {}
            Err(_) => {
                // Corrupted payload: auto-recover.
                warn!(path = %path.display(), "Removing corrupted lock file");
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Sweep every lock file whose owner pid is not alive. Returns the
    /// count removed.
    pub fn cleanup_stale(&self) -> Result<usize, std::io::Error> {
        if !self.locks_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.locks_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "lock") {
                continue;
            }
            let stale = match read_lock_file(&path) {
                Ok(Some(lock)) => !is_pid_alive(lock.pid),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn read_lock_file(path: &Path) -> Result<Option<LockFile>, serde_json::Error> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map(Some),
        Err(_) => Ok(None),
    }
}

/// Process-table probe standing in for a signal-0 liveness check.
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let sys_pid = sysinfo::Pid::from_u32(pid);
    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);
    system.process(sys_pid).is_some()
}
