//! Iteration and tool-call records: one agent turn and the structured
//! tool invocations it emitted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of the session's optional test script for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    Pass,
    Fail,
}

impl TestResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent turn. Immutable once `ended_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub session_id: String,
    pub started_at: String,
    #[serde(default)]
    pub ended_at: Option<String>,
    /// Commit produced by this turn, if the agent changed anything.
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub changed_files: u32,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub test_result: Option<TestResult>,
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Full command line the adapter spawned, for reproduction.
    #[serde(default)]
    pub command_line: Option<String>,
    /// Merged agent output, redacted, possibly truncated.
    #[serde(default)]
    pub output: Option<String>,
}

impl Iteration {
    pub fn new(session_id: &str) -> Self {
        Self {
            id: crate::types::new_id(),
            session_id: session_id.to_string(),
            started_at: crate::types::now_ts(),
            ended_at: None,
            commit_sha: None,
            changed_files: 0,
            exit_code: None,
            test_result: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            model: None,
            agent_version: None,
            command_line: None,
            output: None,
        }
    }
}

/// One structured tool invocation emitted by the agent mid-iteration.
/// Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub session_id: String,
    pub iteration_id: String,
    pub ts: String,
    pub tool_name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
    pub success: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub message_id: Option<String>,
}
