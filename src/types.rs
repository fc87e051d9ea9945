// src/types.rs

//! Small shared enums and name aliases.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical task name type.
pub type TaskName = String;

/// Canonical workflow name type.
pub type WorkflowName = String;

/// Behaviour when a run request arrives while the same workflow is already
/// executing.
///
/// - `Queue`: keep the request (up to `queue_length`) and start it when the
///   current run finishes (default behaviour).
/// - `Cancel`: drop previously queued requests and keep only the latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerWhileRunningBehaviour {
    #[default]
    Queue,
    Cancel,
}

impl FromStr for TriggerWhileRunningBehaviour {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queue" => Ok(TriggerWhileRunningBehaviour::Queue),
            "cancel" => Ok(TriggerWhileRunningBehaviour::Cancel),
            other => Err(format!(
                "invalid triggered_while_running_behaviour: {other} (expected \"queue\" or \"cancel\")"
            )),
        }
    }
}

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Always wait `retry_delay`.
    Fixed,
    /// Wait `retry_delay * 2^(attempt - 1)`, capped at `max_retry_delay`.
    #[default]
    Exponential,
}

/// What the service supervisor does when a service container exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

/// Why a workflow run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Manual,
    Schedule,
    Backfill,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Schedule => "schedule",
            RunTrigger::Backfill => "backfill",
        };
        f.pad(s)
    }
}

/// Whether a workflow run actually launches containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Normal,
    /// Validate, plan and check task configs; launch nothing.
    DryRun,
}

/// Which isolation backend to use for containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Probe the host and pick the strongest available backend.
    #[default]
    Auto,
    /// Plain host processes, no enforcement.
    Host,
    /// Linux cgroup v2 (fails over to `host` with warnings if unavailable).
    Cgroup,
}
