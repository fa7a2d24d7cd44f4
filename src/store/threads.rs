use anyhow::Result;
use rusqlite::{params, Row};

use super::Store;
use crate::types::{MessageRole, Thread, ThreadMessage};

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ThreadMessage> {
    let role: String = row.get("role")?;
    Ok(ThreadMessage {
        id: row.get("id")?,
        thread_id: row.get("thread_id")?,
        idx: row.get::<_, i64>("idx")? as u32,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::System),
        content: row.get("content")?,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    pub fn create_thread(&self, session_id: &str) -> Result<Thread> {
        let thread = Thread {
            id: crate::types::new_id(),
            session_id: session_id.to_string(),
            created_at: crate::types::now_ts(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (id, session_id, created_at) VALUES (?1, ?2, ?3)",
                params![thread.id, thread.session_id, thread.created_at],
            )?;
            Ok(())
        })?;
        Ok(thread)
    }

    pub fn threads_for(&self, session_id: &str) -> Result<Vec<Thread>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, created_at FROM threads
                 WHERE session_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([session_id], |row| {
                Ok(Thread {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Append a message; the index is allocated inside the transaction so
    /// concurrent appenders cannot produce gaps or duplicates.
    pub fn add_thread_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ThreadMessage> {
        let id = crate::types::new_id();
        let created_at = crate::types::now_ts();
        let idx = self.with_tx(|tx| {
            let idx: i64 = tx.query_row(
                "SELECT COALESCE(MAX(idx) + 1, 0) FROM thread_messages WHERE thread_id = ?1",
                [thread_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO thread_messages (id, thread_id, idx, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, thread_id, idx, role.as_str(), content, created_at],
            )?;
            Ok(idx)
        })?;

        Ok(ThreadMessage {
            id,
            thread_id: thread_id.to_string(),
            idx: idx as u32,
            role,
            content: content.to_string(),
            created_at,
        })
    }

    pub fn thread_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM thread_messages WHERE thread_id = ?1 ORDER BY idx",
            )?;
            let rows = stmt.query_map([thread_id], message_from_row)?;
            rows.collect()
        })
    }
}
