//! Structured iteration events and their fan-out.
//!
//! Events are a closed set of variants published from exactly one code
//! site each (the iteration engine); sinks subscribe to everything.

mod bus;
mod sinks;

pub use bus::{EventBus, EventSink};
pub use sinks::{JsonlSink, StoreSink};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationOutcome {
    Success,
    Failed,
    AwaitingInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
}

/// Event payloads. The serde tag doubles as the on-disk `kind` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    IterationStart {
        sequence: u32,
        sha_before: Option<String>,
    },
    IterationEnd {
        outcome: IterationOutcome,
        duration_ms: u64,
        exit_code: i32,
    },
    UserMessage {
        text: String,
    },
    LlmUsage {
        model: String,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
        total_tokens: Option<u64>,
        cost_usd: Option<f64>,
        latency_ms: Option<u64>,
    },
    ToolCall {
        tool_name: String,
        arguments: serde_json::Value,
        success: bool,
        duration_ms: Option<u64>,
        started_at: Option<String>,
        ended_at: Option<String>,
    },
    FileEdit {
        path: String,
        lines_added: u32,
        lines_deleted: u32,
        operation: FileOperation,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
    },
    TestResult {
        framework: String,
        command: String,
        total: u32,
        passed: u32,
        failed: u32,
        skipped: u32,
        duration_ms: u64,
        exit: i32,
    },
}

impl EventKind {
    /// The stable `kind` string used in the JSONL log.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::IterationStart { .. } => "iteration_start",
            Self::IterationEnd { .. } => "iteration_end",
            Self::UserMessage { .. } => "user_message",
            Self::LlmUsage { .. } => "llm_usage",
            Self::ToolCall { .. } => "tool_call",
            Self::FileEdit { .. } => "file_edit",
            Self::TestResult { .. } => "test_result",
        }
    }
}

/// One published event, scoped to a session and usually an iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub ts: String,
    pub session_id: String,
    pub iteration_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl MetricsEvent {
    pub fn new(session_id: &str, iteration_id: Option<&str>, kind: EventKind) -> Self {
        Self {
            ts: crate::types::now_ts(),
            session_id: session_id.to_string(),
            iteration_id: iteration_id.map(str::to_string),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tag_matches_kind_str() {
        let event = MetricsEvent::new(
            "s1",
            Some("i1"),
            EventKind::UserMessage {
                text: "hello".to_string(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "user_message");
        assert_eq!(event.kind.kind_str(), "user_message");
        assert_eq!(value["session_id"], "s1");
    }

    #[test]
    fn test_event_round_trip() {
        let event = MetricsEvent::new(
            "s1",
            Some("i1"),
            EventKind::LlmUsage {
                model: "gpt-5".to_string(),
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                total_tokens: Some(15),
                cost_usd: Some(0.01),
                latency_ms: None,
            },
        );
        let text = serde_json::to_string(&event).unwrap();
        let parsed: MetricsEvent = serde_json::from_str(&text).unwrap();
        match parsed.kind {
            EventKind::LlmUsage { total_tokens, .. } => assert_eq!(total_tokens, Some(15)),
            other => panic!("wrong kind: {other:?}"),
        }
    }
}
