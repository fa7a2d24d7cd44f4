//! Logging setup.
//!
//! Stderr is the default sink; setting `logging.to_file` redirects
//! output to a timestamped file under `<config-dir>/logs/` instead.
//! `RUST_LOG` overrides the configured level either way.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Keep this handle alive for the life of the process; dropping it
/// flushes the non-blocking file writer.
pub struct LoggingHandle {
    pub _guard: Option<WorkerGuard>,

    /// Where log lines are going, when file logging is active.
    pub log_file_path: Option<PathBuf>,
}

/// Effective level: a `--debug` flag beats the config value.
fn resolve_level(config: &Config, debug_override: bool) -> String {
    if debug_override {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    }
}

/// One log file per process start, named by launch time.
fn log_file_name(now: DateTime<Utc>) -> String {
    format!("conductor-{}.log", now.format("%Y-%m-%d-%H%M%S"))
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_logging(config: &Config, debug_override: bool) -> Result<LoggingHandle> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(resolve_level(config, debug_override)));

    if !config.logging.to_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
        return Ok(LoggingHandle {
            _guard: None,
            log_file_path: None,
        });
    }

    let logs_dir = Config::logs_dir();
    std::fs::create_dir_all(&logs_dir)?;
    let file_name = log_file_name(Utc::now());

    let appender = tracing_appender::rolling::never(&logs_dir, &file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();

    Ok(LoggingHandle {
        _guard: Some(guard),
        log_file_path: Some(logs_dir.join(file_name)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // The global subscriber can only be installed once per process, so
    // these exercise the naming and level logic directly.

    #[test]
    fn test_log_file_name_format() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, 5, 15, 0).unwrap();
        assert_eq!(log_file_name(ts), "conductor-2025-03-04-051500.log");
    }

    #[test]
    fn test_log_file_name_distinct_per_second() {
        let a = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        assert_ne!(log_file_name(a), log_file_name(b));
    }

    #[test]
    fn test_resolve_level_debug_override_wins() {
        let config = Config::default();
        assert_eq!(resolve_level(&config, false), "info");
        assert_eq!(resolve_level(&config, true), "debug");
    }

    #[test]
    fn test_resolve_level_honors_config() {
        let mut config = Config::default();
        config.logging.level = "trace".to_string();
        assert_eq!(resolve_level(&config, false), "trace");
        // Override still wins over an explicit config level.
        assert_eq!(resolve_level(&config, true), "debug");
    }

    #[test]
    fn test_stderr_is_default_sink() {
        let config = Config::default();
        assert!(!config.logging.to_file, "file logging must be opt-in");
    }

    #[test]
    fn test_file_mode_targets_logs_dir() {
        let dir = Config::logs_dir();
        assert!(dir.ends_with("logs"));
        let path = dir.join(log_file_name(Utc::now()));
        assert!(path.to_string_lossy().contains("conductor-"));
        assert!(path.extension().is_some_and(|e| e == "log"));
    }
}
