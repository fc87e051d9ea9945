// src/dag/run_state.rs

//! Per-run bookkeeping of task records and skip propagation.

use std::collections::HashSet;

use chrono::Utc;
use tracing::debug;

use crate::dag::execution::{ExecutionStatus, TaskRecord, aggregate_status};
use crate::dag::graph::DagGraph;
use crate::dag::task_state::{TaskEvent, TaskState};
use crate::types::TaskName;

/// Tracks the record of every task of one run, indexed like the graph.
pub struct RunTracker<'a> {
    graph: &'a DagGraph,
    records: Vec<TaskRecord>,
}

impl<'a> RunTracker<'a> {
    pub fn new(graph: &'a DagGraph) -> Self {
        let records = graph.tasks().map(TaskRecord::pending).collect();
        Self { graph, records }
    }

    pub fn record(&self, name: &str) -> Option<&TaskRecord> {
        self.graph.position(name).map(|i| &self.records[i])
    }

    pub fn state_of(&self, name: &str) -> Option<TaskState> {
        self.record(name).map(|r| r.state)
    }

    /// First dependency of `name` that did not succeed, if any.
    pub fn blocking_dependency(&self, name: &str) -> Option<TaskName> {
        self.graph
            .dependencies_of(name)
            .into_iter()
            .find(|dep| self.state_of(dep) != Some(TaskState::Succeeded))
            .map(str::to_string)
    }

    /// Store the final record of a task that ran.
    pub fn finish(&mut self, record: TaskRecord) {
        if let Some(i) = self.graph.position(&record.task) {
            self.records[i] = record;
        }
    }

    /// Mark a not-yet-started task `Skipped`. Returns false if the task had
    /// already left `Pending`.
    pub fn skip(&mut self, name: &str, reason: impl Into<String>) -> bool {
        let Some(i) = self.graph.position(name) else {
            return false;
        };
        let record = &mut self.records[i];
        match record.state.on(TaskEvent::Skip) {
            Some(next) => {
                record.state = next;
                record.error = Some(reason.into());
                record.finished_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Mark every pending transitive dependent of a task that did not
    /// succeed as `Skipped`.
    ///
    /// Returns the newly skipped tasks.
    pub fn mark_dependents_skipped(&mut self, upstream: &str) -> Vec<TaskName> {
        let mut stack: Vec<TaskName> = self
            .graph
            .dependents_of(upstream)
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut visited: HashSet<TaskName> = HashSet::new();
        let mut newly_skipped = Vec::new();

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if self.skip(&name, format!("upstream task '{upstream}' did not succeed")) {
                debug!(task = %name, upstream, "skipping dependent of unsuccessful task");
                stack.extend(self.graph.dependents_of(&name).into_iter().map(str::to_string));
                newly_skipped.push(name);
            }
        }

        newly_skipped
    }

    /// Skip every task that has not started yet.
    pub fn skip_remaining(&mut self, reason: &str) -> Vec<TaskName> {
        let pending: Vec<TaskName> = self
            .records
            .iter()
            .filter(|r| r.state == TaskState::Pending)
            .map(|r| r.task.clone())
            .collect();
        for name in &pending {
            self.skip(name, reason);
        }
        pending
    }

    pub fn all_terminal(&self) -> bool {
        self.records.iter().all(|r| r.state.is_terminal())
    }

    pub fn status(&self) -> ExecutionStatus {
        aggregate_status(self.graph, &self.records)
    }

    /// Records in declaration order.
    pub fn into_records(self) -> Vec<TaskRecord> {
        self.records
    }
}
