//! Core entity types shared across the store, workspace manager, and
//! batch scheduler.

mod batch;
mod iteration;
mod session;
mod thread;

pub use batch::{BatchDefaults, BatchItem, BatchItemStatus, BatchRun, BatchRunStatus};
pub use iteration::{Iteration, TestResult, ToolCall};
pub use session::{slugify, Session, SessionMode, SessionStatus};
pub use thread::{MessageRole, Thread, ThreadMessage};

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a timestamp the way every persisted record stores it:
/// ISO-8601 UTC with second precision.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current time in the persisted string form.
pub fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Generate a fresh opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ts_is_utc_iso8601() {
        let ts = now_ts();
        assert!(ts.ends_with('Z'), "timestamp should be UTC: {ts}");
        assert!(
            chrono::DateTime::parse_from_rfc3339(&ts).is_ok(),
            "timestamp should round-trip: {ts}"
        );
    }

    #[test]
    fn test_new_id_unique() {
        assert_ne!(new_id(), new_id());
    }
}
