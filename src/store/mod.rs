//! Embedded session store: a single-file sqlite database holding
//! sessions, iterations, tool calls, threads, batch runs, and batch
//! items, with a versioned migration mechanism.
//!
//! Raw agent output lives on iteration rows; the JSONL event log (see
//! `metrics`) is the append-only companion. sqlite serializes its own
//! writers, so the store is shared behind a mutex and safe to call from
//! any task.

mod batch;
mod export;
mod iterations;
mod schema;
pub(crate) mod sessions;
mod threads;
mod tool_calls;

pub use export::SessionExport;
pub use iterations::FollowUpPrompt;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_migrations()?;
        Ok(store)
    }

    fn apply_migrations(&self) -> Result<()> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );
            "#,
        )?;

        let current: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )?;

        for migration in schema::MIGRATIONS {
            if migration.version <= current {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql)?;
            tx.execute(
                "INSERT INTO migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.name,
                    crate::types::now_ts()
                ],
            )?;
            tx.commit()?;
            info!(version = migration.version, name = migration.name, "Applied migration");
        }

        Ok(())
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn).context("store query failed")
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
