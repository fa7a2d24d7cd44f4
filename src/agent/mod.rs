//! Agent adapter: spawning the external coding-agent binary, driving it
//! one-shot or interactively, and extracting structured telemetry.

mod adapter;
mod interactive;
mod redact;
pub mod telemetry;

pub use adapter::{AgentAdapter, AuthStatus, RunOutcome, RunRequest};
pub use interactive::{HandleState, InteractiveHandle, StreamEvent};
pub use redact::{SecretRedactor, REDACTED};
pub use telemetry::{parse_output, ParsedToolCall, Telemetry};

/// Auth token forwarded to the agent when present in our environment.
pub const AUTH_TOKEN_ENV: &str = "AGENT_AUTH_TOKEN";

/// Endpoint override exported when a server URL is configured.
pub const URL_ENV: &str = "AGENT_URL";

/// Set to "0" only for localhost endpoints (local development).
pub const TLS_REJECT_ENV: &str = "NODE_TLS_REJECT_UNAUTHORIZED";

/// Flag enabling line-delimited JSON event output in one-shot mode.
pub const JSON_LOGS_FLAG: &str = "--jsonl";

/// Phrases marking an agent that stopped to wait for the user.
pub const INTERACTIVE_PROMPT_MARKERS: &[&str] = &[
    "awaiting your input",
    "waiting for your reply",
    "needs your input",
    "reply to continue",
];

/// True when agent output ends an otherwise empty turn by asking the
/// user something.
pub fn contains_interactive_marker(output: &str) -> bool {
    let lower = output.to_lowercase();
    INTERACTIVE_PROMPT_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interactive_marker_case_insensitive() {
        assert!(contains_interactive_marker("AWAITING YOUR INPUT please"));
        assert!(contains_interactive_marker("I need more info — reply to continue."));
        assert!(!contains_interactive_marker("all done, committed"));
    }
}
