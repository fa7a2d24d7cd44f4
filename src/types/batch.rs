//! Batch runs and their planned items.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchRunStatus {
    Running,
    Completed,
    Aborted,
    Error,
}

impl BatchRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for BatchRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Queued,
    Running,
    Success,
    Fail,
    Timeout,
    Error,
}

impl BatchItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "fail" => Some(Self::Fail),
            "timeout" => Some(Self::Timeout),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Terminal states: transitions out of queued/running are final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for BatchItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Defaults applied to matrix entries that omit a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchDefaults {
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub script_command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub merge_on_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: String,
    pub defaults: BatchDefaults,
    pub concurrency: u32,
    pub created_at: String,
    pub status: BatchRunStatus,
}

/// One planned session within a run. Owns its session once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub run_id: String,
    pub repo_path: String,
    pub prompt: String,
    pub status: BatchItemStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub token_total: Option<u64>,
    #[serde(default)]
    pub tool_call_count: u32,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_status_terminal() {
        assert!(!BatchItemStatus::Queued.is_terminal());
        assert!(!BatchItemStatus::Running.is_terminal());
        assert!(BatchItemStatus::Success.is_terminal());
        assert!(BatchItemStatus::Fail.is_terminal());
        assert!(BatchItemStatus::Timeout.is_terminal());
        assert!(BatchItemStatus::Error.is_terminal());
    }

    #[test]
    fn test_status_round_trips() {
        for s in ["queued", "running", "success", "fail", "timeout", "error"] {
            assert_eq!(BatchItemStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
        for s in ["running", "completed", "aborted", "error"] {
            assert_eq!(BatchRunStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
    }
}
