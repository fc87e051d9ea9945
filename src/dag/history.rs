// src/dag/history.rs

//! Bounded per-workflow execution history.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::execution::Execution;
use crate::errors::Result;
use crate::store::{RecordKind, StateStore};
use crate::types::WorkflowName;

/// Most recent executions of one workflow, oldest first.
///
/// Eviction is pure FIFO on insertion order once `limit` is exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHistory {
    pub workflow: WorkflowName,
    pub limit: usize,
    pub executions: VecDeque<Execution>,
}

impl ExecutionHistory {
    pub fn new(workflow: impl Into<String>, limit: usize) -> Self {
        Self {
            workflow: workflow.into(),
            limit: limit.max(1),
            executions: VecDeque::new(),
        }
    }

    /// Append an execution, returning whatever fell off the front.
    pub fn push(&mut self, execution: Execution) -> Vec<Execution> {
        self.executions.push_back(execution);
        let mut evicted = Vec::new();
        while self.executions.len() > self.limit {
            if let Some(old) = self.executions.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn latest(&self) -> Option<&Execution> {
        self.executions.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Execution> {
        self.executions.iter()
    }
}

/// Append `execution` to the persisted history of its workflow under the
/// workflow's record lock.
pub fn record_execution(store: &StateStore, limit: usize, execution: Execution) -> Result<ExecutionHistory> {
    let workflow = execution.workflow.clone();
    store.update_record(RecordKind::History, &workflow, |current: Option<ExecutionHistory>| {
        let mut history = current.unwrap_or_else(|| ExecutionHistory::new(&workflow, limit));
        history.limit = limit.max(1);
        let evicted = history.push(execution);
        if !evicted.is_empty() {
            debug!(workflow = %workflow, evicted = evicted.len(), "evicted old executions");
        }
        Ok(history)
    })
}

/// Load the persisted history of a workflow (empty if none).
pub fn load_history(store: &StateStore, workflow: &str) -> Result<ExecutionHistory> {
    Ok(store
        .read_record(RecordKind::History, workflow)?
        .unwrap_or_else(|| ExecutionHistory::new(workflow, 100)))
}
