// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `stevedore`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "stevedore",
    version,
    about = "Single-host container runtime with an embedded workflow scheduler.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, global = true, value_name = "PATH", default_value = "Stevedore.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `STEVEDORE_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Parse and validate the config, print execution plans.
    Validate,
    /// Run a workflow once and wait for it to finish.
    Run {
        workflow: String,
        /// Validate and plan only; start no containers.
        #[arg(long)]
        dry_run: bool,
    },
    /// Register a cron schedule (defaults to the workflow's `schedule`).
    Schedule {
        workflow: String,
        cron: Option<String>,
    },
    Unschedule {
        workflow: String,
    },
    /// Stop firing a schedule without forgetting it.
    Pause {
        workflow: String,
    },
    Resume {
        workflow: String,
    },
    /// Run every scheduled occurrence in `[start, end]` that has not run yet.
    Backfill {
        workflow: String,
        #[arg(value_parser = parse_time)]
        start: DateTime<Utc>,
        #[arg(value_parser = parse_time)]
        end: DateTime<Utc>,
    },
    /// Run schedules and services until interrupted.
    Daemon,
    /// Manage snapshot images.
    #[command(subcommand)]
    Image(ImageCommand),
    /// List containers.
    Ps {
        /// Include finished containers.
        #[arg(short, long)]
        all: bool,
        /// Keep running and reprint whenever a container record changes.
        #[arg(short, long)]
        watch: bool,
    },
    /// Show past executions of a workflow.
    History {
        workflow: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum ImageCommand {
    /// Import a root filesystem tarball (optionally gzip) as `name[:tag]`.
    Import { archive: PathBuf, reference: String },
    List,
    Rm { reference: String },
    /// Remove images unused for longer than `image_retention`.
    Prune,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM[:SS]` (UTC) or `YYYY-MM-DD`.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| format!("invalid time '{s}' (expected RFC 3339 or YYYY-MM-DD[THH:MM])"))
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
