// src/errors.rs

//! Crate-wide error type and result alias.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StevedoreError {
    // --- configuration / validation ---
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cycle detected in workflow DAG: {}", .tasks.join(" -> "))]
    CycleDetected { tasks: Vec<String> },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    // --- images ---
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Failed to extract image '{image}': {reason}")]
    ExtractionFailed { image: String, reason: String },

    // --- containers ---
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container '{id}' cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("No free host port for {requested} after {attempts} attempt(s)")]
    PortAllocationExhausted { requested: String, attempts: u32 },

    #[error("Isolation backend '{backend}' cannot enforce {limit}")]
    ResourceLimitUnsupported { backend: String, limit: String },

    #[error("Failed to launch container '{id}': {reason}")]
    LaunchFailed { id: String, reason: String },

    #[error("Timed out after {duration:?} waiting for '{id}'")]
    TimeoutExceeded { id: String, duration: Duration },

    // --- workflow execution ---
    #[error("Task '{task}' failed after {attempts} attempt(s): {reason}")]
    RetriesExhausted {
        task: String,
        attempts: u32,
        reason: String,
    },

    /// Recorded on the task, never returned out of a run.
    #[error("Task '{task}' breached its SLA of {sla:?} (took {elapsed:?})")]
    SlaBreach {
        task: String,
        sla: Duration,
        elapsed: Duration,
    },

    #[error("Scheduler state could not be persisted: {0}")]
    SchedulerPersistenceError(String),

    // --- plumbing ---
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, StevedoreError>;
