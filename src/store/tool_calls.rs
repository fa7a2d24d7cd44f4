use anyhow::Result;
use rusqlite::{params, Row};

use super::Store;
use crate::types::ToolCall;

fn tool_call_from_row(row: &Row<'_>) -> rusqlite::Result<ToolCall> {
    Ok(ToolCall {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        iteration_id: row.get("iteration_id")?,
        ts: row.get("ts")?,
        tool_name: row.get("tool_name")?,
        arguments: row.get("arguments")?,
        success: row.get::<_, i64>("success")? != 0,
        duration_ms: row.get::<_, Option<i64>>("duration_ms")?.map(|v| v as u64),
        message_id: row.get("message_id")?,
    })
}

impl Store {
    /// Tool-call records are append-only; there is no update path.
    pub fn insert_tool_call(&self, call: &ToolCall) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO tool_calls (
                    id, session_id, iteration_id, ts, tool_name, arguments,
                    success, duration_ms, message_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    call.id,
                    call.session_id,
                    call.iteration_id,
                    call.ts,
                    call.tool_name,
                    call.arguments,
                    call.success as i64,
                    call.duration_ms.map(|v| v as i64),
                    call.message_id,
                ],
            )?;
            Ok(())
        })
    }

    /// Tool calls for a session, optionally narrowed to one iteration.
    pub fn tool_calls_for(
        &self,
        session_id: &str,
        iteration_id: Option<&str>,
    ) -> Result<Vec<ToolCall>> {
        self.with_conn(|conn| match iteration_id {
            Some(iteration_id) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tool_calls
                     WHERE session_id = ?1 AND iteration_id = ?2 ORDER BY ts, id",
                )?;
                let rows = stmt.query_map([session_id, iteration_id], tool_call_from_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tool_calls WHERE session_id = ?1 ORDER BY ts, id",
                )?;
                let rows = stmt.query_map([session_id], tool_call_from_row)?;
                rows.collect()
            }
        })
    }
}
