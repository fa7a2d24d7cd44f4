use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::types::{Iteration, TestResult};

fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<Iteration> {
    let test_result: Option<String> = row.get("test_result")?;
    Ok(Iteration {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
        commit_sha: row.get("commit_sha")?,
        changed_files: row.get::<_, i64>("changed_files")? as u32,
        exit_code: row.get("exit_code")?,
        test_result: test_result.as_deref().and_then(TestResult::parse),
        prompt_tokens: row.get::<_, Option<i64>>("prompt_tokens")?.map(|v| v as u64),
        completion_tokens: row
            .get::<_, Option<i64>>("completion_tokens")?
            .map(|v| v as u64),
        total_tokens: row.get::<_, Option<i64>>("total_tokens")?.map(|v| v as u64),
        model: row.get("model")?,
        agent_version: row.get("agent_version")?,
        command_line: row.get("command_line")?,
        output: row.get("output")?,
    })
}

/// A user follow-up note recorded against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpPrompt {
    pub id: String,
    pub session_id: String,
    pub prompt: String,
    pub created_at: String,
}

impl Store {
    pub fn insert_iteration(&self, iteration: &Iteration) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO iterations (
                    id, session_id, started_at, ended_at, commit_sha,
                    changed_files, exit_code, test_result, prompt_tokens,
                    completion_tokens, total_tokens, model, agent_version,
                    command_line, output
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    iteration.id,
                    iteration.session_id,
                    iteration.started_at,
                    iteration.ended_at,
                    iteration.commit_sha,
                    iteration.changed_files,
                    iteration.exit_code,
                    iteration.test_result.map(TestResult::as_str),
                    iteration.prompt_tokens.map(|v| v as i64),
                    iteration.completion_tokens.map(|v| v as i64),
                    iteration.total_tokens.map(|v| v as i64),
                    iteration.model,
                    iteration.agent_version,
                    iteration.command_line,
                    iteration.output,
                ],
            )?;
            Ok(())
        })
    }

    /// Overwrite an iteration's engine-owned fields. Refuses once the
    /// record is closed (`ended_at` set): closed iterations are immutable.
    pub fn update_iteration(&self, iteration: &Iteration) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                r#"
                UPDATE iterations SET
                    commit_sha = ?2, changed_files = ?3, exit_code = ?4,
                    test_result = ?5, prompt_tokens = ?6,
                    completion_tokens = ?7, total_tokens = ?8, model = ?9,
                    agent_version = ?10, command_line = ?11, output = ?12
                WHERE id = ?1 AND ended_at IS NULL
                "#,
                params![
                    iteration.id,
                    iteration.commit_sha,
                    iteration.changed_files,
                    iteration.exit_code,
                    iteration.test_result.map(TestResult::as_str),
                    iteration.prompt_tokens.map(|v| v as i64),
                    iteration.completion_tokens.map(|v| v as i64),
                    iteration.total_tokens.map(|v| v as i64),
                    iteration.model,
                    iteration.agent_version,
                    iteration.command_line,
                    iteration.output,
                ],
            )?;
            Ok(affected > 0)
        })
    }

    /// Close an iteration. The row becomes immutable afterwards.
    pub fn finish_iteration(
        &self,
        iteration_id: &str,
        ended_at: &str,
        exit_code: i32,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE iterations SET ended_at = ?2, exit_code = ?3
                 WHERE id = ?1 AND ended_at IS NULL",
                params![iteration_id, ended_at, exit_code],
            )?;
            Ok(())
        })
    }

    /// Record token usage from an `llm_usage` event.
    pub fn record_iteration_usage(
        &self,
        iteration_id: &str,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
        total_tokens: Option<u64>,
        model: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                UPDATE iterations SET
                    prompt_tokens = COALESCE(?2, prompt_tokens),
                    completion_tokens = COALESCE(?3, completion_tokens),
                    total_tokens = COALESCE(?4, total_tokens),
                    model = ?5
                WHERE id = ?1 AND ended_at IS NULL
                "#,
                params![
                    iteration_id,
                    prompt_tokens.map(|v| v as i64),
                    completion_tokens.map(|v| v as i64),
                    total_tokens.map(|v| v as i64),
                    model,
                ],
            )?;
            Ok(())
        })
    }

    /// Record the test outcome from a `test_result` event.
    pub fn record_iteration_test_result(
        &self,
        iteration_id: &str,
        result: TestResult,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE iterations SET test_result = ?2
                 WHERE id = ?1 AND ended_at IS NULL",
                params![iteration_id, result.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn get_iteration(&self, id: &str) -> Result<Option<Iteration>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM iterations WHERE id = ?1",
                [id],
                iteration_from_row,
            )
            .optional()
        })
    }

    /// Iterations of a session, ordered by start time.
    pub fn iterations_for(&self, session_id: &str) -> Result<Vec<Iteration>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM iterations WHERE session_id = ?1 ORDER BY started_at, id",
            )?;
            let rows = stmt.query_map([session_id], iteration_from_row)?;
            rows.collect()
        })
    }

    pub fn add_follow_up_prompt(&self, session_id: &str, prompt: &str) -> Result<FollowUpPrompt> {
        let record = FollowUpPrompt {
            id: crate::types::new_id(),
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            created_at: crate::types::now_ts(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO follow_up_prompts (id, session_id, prompt, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.id, record.session_id, record.prompt, record.created_at],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    pub fn follow_up_prompts_for(&self, session_id: &str) -> Result<Vec<FollowUpPrompt>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, prompt, created_at FROM follow_up_prompts
                 WHERE session_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([session_id], |row| {
                Ok(FollowUpPrompt {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    prompt: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sessions::tests::sample_session;

    fn store_with_session() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.insert_session(&sample_session("s1")).unwrap();
        store
    }

    #[test]
    fn test_iteration_lifecycle() {
        let store = store_with_session();
        let mut iteration = Iteration::new("s1");
        store.insert_iteration(&iteration).unwrap();

        iteration.commit_sha = Some("a".repeat(40));
        iteration.changed_files = 3;
        iteration.output = Some("did things".to_string());
        assert!(store.update_iteration(&iteration).unwrap());

        store
            .record_iteration_usage(&iteration.id, Some(10), Some(5), Some(15), "gpt-5")
            .unwrap();
        store
            .record_iteration_test_result(&iteration.id, TestResult::Pass)
            .unwrap();
        store
            .finish_iteration(&iteration.id, &crate::types::now_ts(), 0)
            .unwrap();

        let loaded = store.get_iteration(&iteration.id).unwrap().unwrap();
        assert_eq!(loaded.changed_files, 3);
        assert_eq!(loaded.total_tokens, Some(15));
        assert_eq!(loaded.test_result, Some(TestResult::Pass));
        assert!(loaded.ended_at.is_some());
        assert_eq!(loaded.exit_code, Some(0));
    }

    #[test]
    fn test_closed_iteration_is_immutable() {
        let store = store_with_session();
        let mut iteration = Iteration::new("s1");
        store.insert_iteration(&iteration).unwrap();
        store
            .finish_iteration(&iteration.id, &crate::types::now_ts(), 0)
            .unwrap();

        iteration.changed_files = 99;
        assert!(!store.update_iteration(&iteration).unwrap());

        let loaded = store.get_iteration(&iteration.id).unwrap().unwrap();
        assert_eq!(loaded.changed_files, 0);
    }

    #[test]
    fn test_iterations_ordered_by_start() {
        let store = store_with_session();
        let mut a = Iteration::new("s1");
        a.started_at = "2025-01-02T00:00:00Z".to_string();
        let mut b = Iteration::new("s1");
        b.started_at = "2025-01-01T00:00:00Z".to_string();
        store.insert_iteration(&a).unwrap();
        store.insert_iteration(&b).unwrap();

        let list = store.iterations_for("s1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, b.id);
        assert_eq!(list[1].id, a.id);
    }

    #[test]
    fn test_iteration_requires_session() {
        let store = Store::open_in_memory().unwrap();
        let iteration = Iteration::new("ghost");
        assert!(store.insert_iteration(&iteration).is_err());
    }

    #[test]
    fn test_follow_up_prompts() {
        let store = store_with_session();
        assert!(store.follow_up_prompts_for("s1").unwrap().is_empty());

        store.add_follow_up_prompt("s1", "also fix the tests").unwrap();
        store.add_follow_up_prompt("s1", "and the docs").unwrap();

        let prompts = store.follow_up_prompts_for("s1").unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].prompt, "also fix the tests");
    }

    #[test]
    fn test_session_delete_cascades_iterations() {
        let store = store_with_session();
        let iteration = Iteration::new("s1");
        store.insert_iteration(&iteration).unwrap();

        store.delete_session("s1").unwrap();
        assert!(store.get_iteration(&iteration.id).unwrap().is_none());
    }
}
