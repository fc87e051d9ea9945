// src/engine/mod.rs

//! Orchestration engine for stevedore.
//!
//! This module ties together:
//! - run requests from the scheduler, backfill and manual triggers
//! - the per-workflow run queue (what happens when a request arrives while
//!   the workflow is already running)
//! - the main runtime event loop that launches runs and reacts to their
//!   completion and to shutdown signals
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`]; [`launcher`] is the seam to the DAG engine.

use chrono::{DateTime, Utc};

use crate::dag::ExecutionStatus;
use crate::types::{RunTrigger, WorkflowName};

/// Request to run a workflow once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub workflow: WorkflowName,
    pub trigger: RunTrigger,
    /// Scheduled time for cron and backfill runs.
    pub logical_time: Option<DateTime<Utc>>,
}

impl RunRequest {
    pub fn manual(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            trigger: RunTrigger::Manual,
            logical_time: None,
        }
    }

    pub fn scheduled(workflow: impl Into<String>, logical_time: DateTime<Utc>) -> Self {
        Self {
            workflow: workflow.into(),
            trigger: RunTrigger::Schedule,
            logical_time: Some(logical_time),
        }
    }

    pub fn backfill(workflow: impl Into<String>, logical_time: DateTime<Utc>) -> Self {
        Self {
            workflow: workflow.into(),
            trigger: RunTrigger::Backfill,
            logical_time: Some(logical_time),
        }
    }
}

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Exit once no run is active and nothing is queued (used by `run`).
    pub exit_when_idle: bool,
}

/// Events flowing into the runtime from the scheduler, launchers and
/// signal handlers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    RunRequested(RunRequest),
    /// A run ended. `status` is `None` when the run could not start.
    RunFinished {
        workflow: WorkflowName,
        status: Option<ExecutionStatus>,
    },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod launcher;
pub mod queue;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep, DropReason};
pub use launcher::{RunLauncher, WorkflowLauncher};
pub use queue::RunQueue;
pub use runtime::Runtime;
