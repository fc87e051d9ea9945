// src/dag/execution.rs

//! Execution records: what happened during one workflow run.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::graph::DagGraph;
use crate::dag::task_state::TaskState;
use crate::types::{RunTrigger, TaskName, WorkflowName};

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    PartialFailure,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::PartialFailure => "partial_failure",
            ExecutionStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

/// Final record of one task within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: TaskName,
    pub state: TaskState,
    pub attempts: u32,
    /// Time from the first attempt starting to the task finishing.
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sla_breached: bool,
    pub error: Option<String>,
    pub failure_hook: Option<String>,
    /// Container of the last attempt, kept on failure for inspection.
    pub container_id: Option<String>,
}

impl TaskRecord {
    pub fn pending(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            state: TaskState::Pending,
            attempts: 0,
            duration: Duration::ZERO,
            exit_code: None,
            started_at: None,
            finished_at: None,
            sla_breached: false,
            error: None,
            failure_hook: None,
            container_id: None,
        }
    }
}

/// Notification that a task's `on_failure` hook is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub workflow: WorkflowName,
    pub execution_id: String,
    pub task: TaskName,
    pub reason: String,
    pub hook: String,
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow: WorkflowName,
    pub trigger: RunTrigger,
    /// Scheduled time for cron and backfill runs.
    pub logical_time: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub cancelled: bool,
    /// Task records in declaration order.
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub failure_events: Vec<FailureEvent>,
}

impl Execution {
    pub fn task(&self, name: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.task == name)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Reduce per-task outcomes to an execution status.
///
/// - `Success` when every task succeeded.
/// - `Failed` when no task succeeded, or when every sink task failed.
/// - `PartialFailure` otherwise.
pub fn aggregate_status(graph: &DagGraph, records: &[TaskRecord]) -> ExecutionStatus {
    let state_of = |name: &str| {
        records
            .iter()
            .find(|r| r.task == name)
            .map(|r| r.state)
            .unwrap_or(TaskState::Pending)
    };

    if records.iter().all(|r| r.state == TaskState::Succeeded) {
        return ExecutionStatus::Success;
    }

    let any_succeeded = records.iter().any(|r| r.state == TaskState::Succeeded);
    let sinks = graph.sinks();
    let all_sinks_failed =
        !sinks.is_empty() && sinks.iter().all(|s| state_of(s) == TaskState::Failed);

    if !any_succeeded || all_sinks_failed {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::PartialFailure
    }
}
