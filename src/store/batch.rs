use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use super::Store;
use crate::types::{BatchDefaults, BatchItem, BatchItemStatus, BatchRun, BatchRunStatus};

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<BatchRun> {
    let status: String = row.get("status")?;
    let defaults_json: String = row.get("defaults_json")?;
    Ok(BatchRun {
        id: row.get("id")?,
        defaults: serde_json::from_str(&defaults_json).unwrap_or_default(),
        concurrency: row.get::<_, i64>("concurrency")? as u32,
        created_at: row.get("created_at")?,
        status: BatchRunStatus::parse(&status).unwrap_or(BatchRunStatus::Error),
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<BatchItem> {
    let status: String = row.get("status")?;
    Ok(BatchItem {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        repo_path: row.get("repo_path")?,
        prompt: row.get("prompt")?,
        status: BatchItemStatus::parse(&status).unwrap_or(BatchItemStatus::Error),
        session_id: row.get("session_id")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        commit_sha: row.get("commit_sha")?,
        token_total: row.get::<_, Option<i64>>("token_total")?.map(|v| v as u64),
        tool_call_count: row.get::<_, i64>("tool_call_count")? as u32,
        error: row.get("error")?,
    })
}

impl Store {
    pub fn insert_batch_run(
        &self,
        id: &str,
        defaults: &BatchDefaults,
        concurrency: u32,
    ) -> Result<BatchRun> {
        let run = BatchRun {
            id: id.to_string(),
            defaults: defaults.clone(),
            concurrency,
            created_at: crate::types::now_ts(),
            status: BatchRunStatus::Running,
        };
        let defaults_json = serde_json::to_string(defaults)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO batch_runs (id, defaults_json, concurrency, created_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id,
                    defaults_json,
                    run.concurrency,
                    run.created_at,
                    run.status.as_str()
                ],
            )?;
            Ok(())
        })?;
        Ok(run)
    }

    pub fn get_batch_run(&self, id: &str) -> Result<Option<BatchRun>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT * FROM batch_runs WHERE id = ?1", [id], run_from_row)
                .optional()
        })
    }

    pub fn update_batch_run_status(&self, id: &str, status: BatchRunStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE batch_runs SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn insert_batch_item(&self, item: &BatchItem) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO batch_items (
                    id, run_id, repo_path, prompt, status, session_id,
                    started_at, finished_at, commit_sha, token_total,
                    tool_call_count, error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    item.id,
                    item.run_id,
                    item.repo_path,
                    item.prompt,
                    item.status.as_str(),
                    item.session_id,
                    item.started_at,
                    item.finished_at,
                    item.commit_sha,
                    item.token_total.map(|v| v as i64),
                    item.tool_call_count,
                    item.error,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_batch_item(&self, item: &BatchItem) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                UPDATE batch_items SET
                    status = ?2, session_id = ?3, started_at = ?4,
                    finished_at = ?5, commit_sha = ?6, token_total = ?7,
                    tool_call_count = ?8, error = ?9
                WHERE id = ?1
                "#,
                params![
                    item.id,
                    item.status.as_str(),
                    item.session_id,
                    item.started_at,
                    item.finished_at,
                    item.commit_sha,
                    item.token_total.map(|v| v as i64),
                    item.tool_call_count,
                    item.error,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_batch_item(&self, id: &str) -> Result<Option<BatchItem>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT * FROM batch_items WHERE id = ?1", [id], item_from_row)
                .optional()
        })
    }

    /// Items of a run, in insertion (plan) order, optionally filtered.
    pub fn batch_items(
        &self,
        run_id: &str,
        filter: Option<BatchItemStatus>,
    ) -> Result<Vec<BatchItem>> {
        self.with_conn(|conn| match filter {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM batch_items WHERE run_id = ?1 AND status = ?2 ORDER BY rowid",
                )?;
                let rows = stmt.query_map(params![run_id, status.as_str()], item_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT * FROM batch_items WHERE run_id = ?1 ORDER BY rowid")?;
                let rows = stmt.query_map([run_id], item_from_row)?;
                rows.collect()
            }
        })
    }
}
