// src/dag/task_state.rs

//! Per-task lifecycle within a single workflow run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// State of one task inside one execution.
///
/// ```text
/// Pending -> Running -> Succeeded
///                    -> RetryScheduled{delay} -> Running
///                    -> Failed
/// Pending / RetryScheduled -> Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    Pending,
    Running,
    RetryScheduled { delay: Duration },
    Succeeded,
    Failed,
    Skipped,
}

/// Input to the task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    Succeed,
    /// The attempt failed; `retry_after` is set when another attempt is due.
    Fail { retry_after: Option<Duration> },
    Skip,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    /// Apply an event. Returns `None` for a transition the lifecycle does
    /// not allow.
    pub fn on(self, event: TaskEvent) -> Option<TaskState> {
        use TaskState::*;
        match (self, event) {
            (Pending, TaskEvent::Start) | (RetryScheduled { .. }, TaskEvent::Start) => Some(Running),
            (Pending, TaskEvent::Skip) | (RetryScheduled { .. }, TaskEvent::Skip) => Some(Skipped),
            (Running, TaskEvent::Succeed) => Some(Succeeded),
            (Running, TaskEvent::Fail { retry_after: Some(delay) }) => {
                Some(RetryScheduled { delay })
            }
            (Running, TaskEvent::Fail { retry_after: None }) => Some(Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => f.write_str("pending"),
            TaskState::Running => f.write_str("running"),
            TaskState::RetryScheduled { delay } => write!(f, "retry in {delay:?}"),
            TaskState::Succeeded => f.write_str("succeeded"),
            TaskState::Failed => f.write_str("failed"),
            TaskState::Skipped => f.write_str("skipped"),
        }
    }
}
