//! Standard sinks: the store sink persists event-derived columns and
//! tool-call rows; the JSONL sink appends one line per event.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{EventKind, EventSink, MetricsEvent};
use crate::store::Store;
use crate::types::{TestResult, ToolCall};

pub struct StoreSink {
    store: Arc<Store>,
}

impl StoreSink {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl EventSink for StoreSink {
    fn name(&self) -> &str {
        "store"
    }

    fn write(&self, event: &MetricsEvent) -> Result<()> {
        let Some(iteration_id) = event.iteration_id.as_deref() else {
            return Ok(());
        };

        match &event.kind {
            EventKind::IterationEnd { exit_code, .. } => {
                self.store
                    .finish_iteration(iteration_id, &event.ts, *exit_code)?;
            }
            EventKind::LlmUsage {
                model,
                prompt_tokens,
                completion_tokens,
                total_tokens,
                ..
            } => {
                self.store.record_iteration_usage(
                    iteration_id,
                    *prompt_tokens,
                    *completion_tokens,
                    *total_tokens,
                    model,
                )?;
            }
            EventKind::ToolCall {
                tool_name,
                arguments,
                success,
                duration_ms,
                started_at,
                ..
            } => {
                self.store.insert_tool_call(&ToolCall {
                    id: crate::types::new_id(),
                    session_id: event.session_id.clone(),
                    iteration_id: iteration_id.to_string(),
                    ts: started_at.clone().unwrap_or_else(|| event.ts.clone()),
                    tool_name: tool_name.clone(),
                    arguments: arguments.to_string(),
                    success: *success,
                    duration_ms: *duration_ms,
                    message_id: None,
                })?;
            }
            EventKind::TestResult { exit, .. } => {
                let result = if *exit == 0 {
                    TestResult::Pass
                } else {
                    TestResult::Fail
                };
                self.store
                    .record_iteration_test_result(iteration_id, result)?;
            }
            EventKind::IterationStart { .. }
            | EventKind::UserMessage { .. }
            | EventKind::FileEdit { .. } => {}
        }
        Ok(())
    }
}

/// Newline-delimited JSON sink. Each line carries
/// `{ts, seq, kind, session, iteration?, payload}` with `seq` monotonic
/// within the file, surviving re-opens of an existing log.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
    seq: AtomicU64,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let existing_lines = match File::open(path) {
            Ok(f) => BufReader::new(f).lines().count() as u64,
            Err(_) => 0,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            seq: AtomicU64::new(existing_lines),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn write(&self, event: &MetricsEvent) -> Result<()> {
        // Payload is the variant's fields without the tag.
        let mut payload = serde_json::to_value(&event.kind)?;
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("kind");
        }

        let line = serde_json::json!({
            "ts": event.ts,
            "seq": self.seq.fetch_add(1, Ordering::SeqCst),
            "kind": event.kind.kind_str(),
            "session": event.session_id,
            "iteration": event.iteration_id,
            "payload": payload,
        });

        let mut file = self.file.lock().expect("jsonl mutex poisoned");
        writeln!(file, "{line}").context("Failed to append event line")?;
        Ok(())
    }
}
