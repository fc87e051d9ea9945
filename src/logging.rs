// src/logging.rs

//! Logging setup for `stevedore` using `tracing` + `tracing-subscriber`.
//!
//! The filter is chosen in this order:
//! 1. `--log-level` sets the level for stevedore's own targets.
//! 2. `STEVEDORE_LOG` is read as a full filter directive, so
//!    `STEVEDORE_LOG=stevedore::scheduler=trace,notify=debug` works; a bare
//!    level such as `debug` applies to stevedore's targets only.
//! 3. Otherwise stevedore logs at `info`.
//!
//! Other crates (`notify`, `tokio`) are held at `warn` unless a directive
//! names them. Logs go to STDERR; stdout is reserved for command output
//! (`ps`, `history`, dry-run plans).

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

/// Environment variable consulted when no CLI level is given.
pub const LOG_ENV_VAR: &str = "STEVEDORE_LOG";

/// Filter directive for stevedore at `level`, everything else at `warn`.
pub fn default_filter(level: Level) -> String {
    format!("warn,stevedore={level},stevedore_test_utils={level}").to_lowercase()
}

/// Build the filter from a `STEVEDORE_LOG` value.
pub fn filter_from_env_value(value: &str) -> Result<EnvFilter> {
    let value = value.trim();
    let directive = match parse_level_str(value) {
        Some(level) => default_filter(level),
        None => value.to_string(),
    };
    EnvFilter::try_new(&directive).with_context(|| format!("invalid {LOG_ENV_VAR} value '{value}'"))
}

/// Initialise global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = match (cli_level, std::env::var(LOG_ENV_VAR)) {
        (Some(lvl), _) => EnvFilter::new(default_filter(level_from_log_level(lvl))),
        (None, Ok(value)) => filter_from_env_value(&value)?,
        (None, Err(_)) => EnvFilter::new(default_filter(Level::INFO)),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn level_from_log_level(lvl: LogLevel) -> Level {
    match lvl {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_level_strings_are_lenient() {
        assert_eq!(parse_level_str(" WARNING "), Some(Level::WARN));
        assert_eq!(parse_level_str("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level_str("loud"), None);
    }

    #[test]
    fn default_filter_scopes_the_level_to_stevedore() {
        assert_eq!(
            default_filter(Level::DEBUG),
            "warn,stevedore=debug,stevedore_test_utils=debug"
        );
    }

    #[test]
    fn env_value_accepts_levels_and_directives() {
        assert_eq!(
            filter_from_env_value("debug").unwrap().to_string(),
            EnvFilter::new(default_filter(Level::DEBUG)).to_string()
        );
        assert!(filter_from_env_value("stevedore::scheduler=trace,notify=debug").is_ok());
        assert!(filter_from_env_value("stevedore=loud").is_err());
    }
}
