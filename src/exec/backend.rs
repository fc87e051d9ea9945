// src/exec/backend.rs

//! Pluggable task executor abstraction.
//!
//! The DAG engine talks to a `TaskExecutor` instead of the container runtime
//! directly. Production code uses
//! [`ContainerTaskExecutor`](super::task_runner::ContainerTaskExecutor);
//! tests provide scripted executors that never spawn processes.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::dag::workflow::Task;
use crate::types::WorkflowName;

/// One attempt of one task within an execution.
#[derive(Debug, Clone)]
pub struct TaskAttempt {
    pub workflow: WorkflowName,
    pub execution_id: String,
    pub task: Task,
    /// 1-based.
    pub attempt: u32,
    pub log_path: PathBuf,
}

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded {
        exit_code: i32,
        duration: Duration,
    },
    Failed {
        exit_code: Option<i32>,
        reason: String,
        duration: Duration,
    },
    TimedOut {
        duration: Duration,
    },
    LaunchFailed {
        reason: String,
    },
    /// The run was cancelled while the attempt was in flight.
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Succeeded { .. })
    }

    /// Failures that the retry policy may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Failed { .. }
                | AttemptOutcome::TimedOut { .. }
                | AttemptOutcome::LaunchFailed { .. }
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AttemptOutcome::Succeeded { exit_code, .. } => Some(*exit_code),
            AttemptOutcome::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Human-readable failure reason; `None` on success.
    pub fn reason(&self) -> Option<String> {
        match self {
            AttemptOutcome::Succeeded { .. } => None,
            AttemptOutcome::Failed { reason, .. } => Some(reason.clone()),
            AttemptOutcome::TimedOut { duration } => Some(format!("timed out after {duration:?}")),
            AttemptOutcome::LaunchFailed { reason } => Some(format!("launch failed: {reason}")),
            AttemptOutcome::Cancelled => Some("cancelled".to_string()),
        }
    }
}

/// An [`AttemptOutcome`] plus the container that ran it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    pub container_id: Option<String>,
}

impl From<AttemptOutcome> for AttemptReport {
    fn from(outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            container_id: None,
        }
    }
}

impl AttemptReport {
    pub fn with_container(mut self, id: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self
    }
}

/// Trait abstracting how a task attempt is executed.
///
/// Implementations must honour `cancel`: once it fires, the attempt stops
/// its work and reports [`AttemptOutcome::Cancelled`].
pub trait TaskExecutor: Send + Sync {
    fn run_attempt(
        &self,
        attempt: TaskAttempt,
        cancel: CancelToken,
    ) -> Pin<Box<dyn Future<Output = AttemptReport> + Send + '_>>;
}
