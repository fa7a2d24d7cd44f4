//! Session: one agent-driven work unit against one repository branch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Idle,
    Running,
    AwaitingInput,
    Error,
    Done,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting-input",
            Self::Error => "error",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "awaiting-input" => Some(Self::AwaitingInput),
            "error" => Some(Self::Error),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the session's agent is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// One-shot turns; each iteration spawns the agent once.
    Async,
    /// Long-lived streaming agent process.
    Interactive,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Interactive => "interactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "async" => Some(Self::Async),
            "interactive" => Some(Self::Interactive),
            _ => None,
        }
    }
}

/// A session row. The workspace directory at `worktree_path` is owned
/// exclusively by this record until cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    /// The prompt that drives the first iteration.
    pub prompt: String,
    /// Absolute path to the repository root the workspace was carved from.
    pub repo_root: PathBuf,
    /// Branch the session will merge back into.
    pub base_branch: String,
    /// Derived branch name: `<prefix>/<slug>/<timestamp>`.
    pub branch_name: String,
    /// Absolute workspace path: `<repo_root>/.worktrees/<id>`.
    pub worktree_path: PathBuf,
    pub status: SessionStatus,
    pub mode: SessionMode,
    /// Optional test command run after a committing iteration.
    #[serde(default)]
    pub script_command: Option<String>,
    /// Optional model override forwarded to the agent.
    #[serde(default)]
    pub model_override: Option<String>,
    /// External agent thread id, once the agent reports one.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub last_run_at: Option<String>,
    /// Back-reference to the batch run that created this session, if any.
    #[serde(default)]
    pub batch_run_id: Option<String>,
}

impl Session {
    /// Directory holding the context files staged for the agent.
    pub fn context_dir(&self) -> PathBuf {
        self.worktree_path.join("AGENT_CONTEXT")
    }
}

/// Sanitize a session name into a branch-safe slug.
pub fn slugify(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    // Collapse runs of dashes so "Fix  bug!!" doesn't become "fix--bug--".
    let mut result = String::with_capacity(slug.len());
    let mut last_dash = false;
    for c in slug.chars() {
        if c == '-' {
            if !last_dash && !result.is_empty() {
                result.push(c);
                last_dash = true;
            }
        } else {
            result.push(c);
            last_dash = false;
        }
    }

    let trimmed = result.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.chars().take(40).collect()
    }
}
