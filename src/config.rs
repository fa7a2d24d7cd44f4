use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable that relocates the whole config directory
/// (database, locks, event logs).
pub const DB_PATH_ENV: &str = "CONDUCTOR_DB_PATH";

/// Environment variable naming the git executable.
pub const GIT_PATH_ENV: &str = "GIT_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Git driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Git executable. `GIT_PATH` env wins over this; falls back to `git`.
    #[serde(default)]
    pub path: Option<String>,

    /// Default per-command timeout in seconds.
    #[serde(default = "default_git_timeout")]
    pub timeout_secs: u64,
}

fn default_git_timeout() -> u64 {
    30
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            path: None,
            timeout_secs: default_git_timeout(),
        }
    }
}

/// External agent process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Agent binary; bare names are looked up on PATH.
    #[serde(default = "default_agent_binary")]
    pub binary: String,

    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// When true, pass the agent's line-delimited JSON log flag.
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,

    /// Environment overrides merged onto the child environment.
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,

    /// When set, exported as the agent's endpoint env var. Localhost URLs
    /// additionally disable TLS verification for local development.
    #[serde(default)]
    pub server_url: Option<String>,
}

fn default_agent_binary() -> String {
    "amp".to_string()
}

fn default_json_logs() -> bool {
    true
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            extra_args: Vec::new(),
            json_logs: default_json_logs(),
            env: std::collections::HashMap::new(),
            server_url: None,
        }
    }
}

/// Session naming and workspace conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Branch prefix: `<prefix>/<slug>/<timestamp>`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Commit subject prefix identifying agent-produced commits.
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,

    /// Directory under the repo root holding session worktrees.
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: String,

    /// Command run by merge preflight when the workspace's top-level
    /// package manifest declares workspaces. None disables the check.
    #[serde(default)]
    pub typecheck_command: Option<String>,
}

fn default_branch_prefix() -> String {
    "amp".to_string()
}

fn default_commit_prefix() -> String {
    "amp:".to_string()
}

fn default_worktree_dir() -> String {
    ".worktrees".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            commit_prefix: default_commit_prefix(),
            worktree_dir: default_worktree_dir(),
            typecheck_command: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to a file under the config dir (false = stderr)
    #[serde(default)]
    pub to_file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            to_file: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            git: GitConfig::default(),
            agent: AgentSettings::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the user config file, then an
    /// explicit file, then `CONDUCTOR__` environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let user_config = Self::config_dir().join("config.toml");
        if user_config.exists() {
            builder = builder.add_source(config::File::from(user_config));
        }

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONDUCTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Persist the config to `<config-dir>/config.toml`.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir().join("config.toml");
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    /// Root directory for all persistent state. `CONDUCTOR_DB_PATH` wins;
    /// otherwise the platform config directory.
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(DB_PATH_ENV) {
            return PathBuf::from(dir);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("conductor")
    }

    /// Path to the embedded session database.
    pub fn db_path() -> PathBuf {
        Self::config_dir().join("sessions.sqlite3")
    }

    /// Directory holding cross-process session lock files.
    pub fn locks_dir() -> PathBuf {
        Self::config_dir().join("locks")
    }

    /// Directory holding per-session append-only event logs.
    pub fn events_dir() -> PathBuf {
        Self::config_dir().join("events")
    }

    /// Directory for file logs when `logging.to_file` is set.
    pub fn logs_dir() -> PathBuf {
        Self::config_dir().join("logs")
    }

    /// Resolve the git executable: env override, then config, then `git`.
    pub fn git_executable(&self) -> String {
        if let Ok(path) = std::env::var(GIT_PATH_ENV) {
            if !path.trim().is_empty() {
                return path;
            }
        }
        self.git
            .path
            .clone()
            .unwrap_or_else(|| "git".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.git.timeout_secs, 30);
        assert_eq!(config.agent.binary, "amp");
        assert!(config.agent.json_logs);
        assert_eq!(config.session.branch_prefix, "amp");
        assert_eq!(config.session.commit_prefix, "amp:");
        assert_eq!(config.session.worktree_dir, ".worktrees");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = Config::default();
        let s = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&s).unwrap();
        assert_eq!(parsed.agent.binary, config.agent.binary);
        assert_eq!(parsed.session.commit_prefix, config.session.commit_prefix);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str("[agent]\nbinary = \"my-agent\"\n").unwrap();
        assert_eq!(parsed.agent.binary, "my-agent");
        assert_eq!(parsed.git.timeout_secs, 30);
    }

    #[test]
    fn test_git_executable_defaults_to_git() {
        let config = Config::default();
        if std::env::var(GIT_PATH_ENV).is_err() {
            assert_eq!(config.git_executable(), "git");
        }
    }

    #[test]
    fn test_db_path_under_config_dir() {
        assert!(Config::db_path().ends_with("sessions.sqlite3"));
        assert!(Config::locks_dir().ends_with("locks"));
    }
}
