use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use std::path::PathBuf;

use super::Store;
use crate::types::{Session, SessionMode, SessionStatus};

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get("status")?;
    let mode: String = row.get("mode")?;
    let repo_root: String = row.get("repo_root")?;
    let worktree_path: String = row.get("worktree_path")?;
    Ok(Session {
        id: row.get("id")?,
        name: row.get("name")?,
        prompt: row.get("prompt")?,
        repo_root: PathBuf::from(repo_root),
        base_branch: row.get("base_branch")?,
        branch_name: row.get("branch_name")?,
        worktree_path: PathBuf::from(worktree_path),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Error),
        mode: SessionMode::parse(&mode).unwrap_or(SessionMode::Async),
        script_command: row.get("script_command")?,
        model_override: row.get("model_override")?,
        thread_id: row.get("thread_id")?,
        created_at: row.get("created_at")?,
        last_run_at: row.get("last_run_at")?,
        batch_run_id: row.get("batch_run_id")?,
    })
}

impl Store {
    pub fn insert_session(&self, session: &Session) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO sessions (
                    id, name, prompt, repo_root, base_branch, branch_name,
                    worktree_path, status, mode, script_command,
                    model_override, thread_id, created_at, last_run_at,
                    batch_run_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    session.id,
                    session.name,
                    session.prompt,
                    session.repo_root.to_string_lossy(),
                    session.base_branch,
                    session.branch_name,
                    session.worktree_path.to_string_lossy(),
                    session.status.as_str(),
                    session.mode.as_str(),
                    session.script_command,
                    session.model_override,
                    session.thread_id,
                    session.created_at,
                    session.last_run_at,
                    session.batch_run_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM sessions WHERE id = ?1",
                [id],
                session_from_row,
            )
            .optional()
        })
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM sessions ORDER BY created_at DESC, id")?;
            let rows = stmt.query_map([], session_from_row)?;
            rows.collect()
        })
    }

    pub fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn set_session_thread(&self, id: &str, thread_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET thread_id = ?2 WHERE id = ?1",
                params![id, thread_id],
            )?;
            Ok(())
        })
    }

    pub fn touch_session_last_run(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_run_at = ?2 WHERE id = ?1",
                params![id, crate::types::now_ts()],
            )?;
            Ok(())
        })
    }

    /// Delete the session row; threads, messages, iterations, tool calls,
    /// and follow-ups cascade.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
            Ok(affected > 0)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::now_ts;

    pub(crate) fn sample_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            name: format!("session {id}"),
            prompt: "add feature".to_string(),
            repo_root: PathBuf::from("/tmp/repo"),
            base_branch: "main".to_string(),
            branch_name: format!("amp/session-{id}/20250101000000"),
            worktree_path: PathBuf::from(format!("/tmp/repo/.worktrees/{id}")),
            status: SessionStatus::Idle,
            mode: SessionMode::Async,
            script_command: Some("npm test".to_string()),
            model_override: None,
            thread_id: None,
            created_at: now_ts(),
            last_run_at: None,
            batch_run_id: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = Store::open_in_memory().unwrap();
        let session = sample_session("s1");
        store.insert_session(&session).unwrap();

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.name, session.name);
        assert_eq!(loaded.status, SessionStatus::Idle);
        assert_eq!(loaded.mode, SessionMode::Async);
        assert_eq!(loaded.worktree_path, session.worktree_path);

        assert!(store.get_session("missing").unwrap().is_none());
    }

    #[test]
    fn test_branch_unique_per_repo() {
        let store = Store::open_in_memory().unwrap();
        store.insert_session(&sample_session("s1")).unwrap();

        let mut dup = sample_session("s2");
        dup.branch_name = sample_session("s1").branch_name;
        assert!(store.insert_session(&dup).is_err());
    }

    #[test]
    fn test_status_update_and_thread() {
        let store = Store::open_in_memory().unwrap();
        store.insert_session(&sample_session("s1")).unwrap();

        store
            .update_session_status("s1", SessionStatus::Running)
            .unwrap();
        store.set_session_thread("s1", "T-123").unwrap();
        store.touch_session_last_run("s1").unwrap();

        let loaded = store.get_session("s1").unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.thread_id.as_deref(), Some("T-123"));
        assert!(loaded.last_run_at.is_some());
    }

    #[test]
    fn test_delete() {
        let store = Store::open_in_memory().unwrap();
        store.insert_session(&sample_session("s1")).unwrap();
        assert!(store.delete_session("s1").unwrap());
        assert!(!store.delete_session("s1").unwrap());
    }

    #[test]
    fn test_list_orders_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let mut a = sample_session("a");
        a.created_at = "2025-01-01T00:00:00Z".to_string();
        let mut b = sample_session("b");
        b.created_at = "2025-06-01T00:00:00Z".to_string();
        store.insert_session(&a).unwrap();
        store.insert_session(&b).unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions[0].id, "b");
        assert_eq!(sessions[1].id, "a");
    }
}
