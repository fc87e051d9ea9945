// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated core state
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - launching runs and reporting their completion
//! - handling Ctrl+C / shutdown
//!
//! The core is unit tested without any Tokio, channels, filesystem, or
//! processes.

use std::collections::{BTreeSet, HashMap};

use crate::engine::event_handlers::{
    CoreStep, handle_run_finished, handle_run_requested, handle_shutdown,
};
use crate::engine::queue::RunQueue;
use crate::engine::{RuntimeEvent, RuntimeOptions};
use crate::types::{TriggerWhileRunningBehaviour, WorkflowName};

/// Which workflows are running and what is queued behind them.
#[derive(Debug)]
pub struct ActiveRuns {
    pub(crate) running: BTreeSet<WorkflowName>,
    pub(crate) queues: HashMap<WorkflowName, RunQueue>,
    behaviour: TriggerWhileRunningBehaviour,
    queue_length: usize,
    pub(crate) shutting_down: bool,
}

impl ActiveRuns {
    fn new(behaviour: TriggerWhileRunningBehaviour, queue_length: usize) -> Self {
        Self {
            running: BTreeSet::new(),
            queues: HashMap::new(),
            behaviour,
            queue_length,
            shutting_down: false,
        }
    }

    pub fn behaviour(&self) -> TriggerWhileRunningBehaviour {
        self.behaviour
    }

    pub(crate) fn queue_for(&mut self, workflow: &str) -> &mut RunQueue {
        let (behaviour, len) = (self.behaviour, self.queue_length);
        self.queues
            .entry(workflow.to_string())
            .or_insert_with(|| RunQueue::new(behaviour, len))
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    pub fn queues_empty(&self) -> bool {
        self.queues.values().all(RunQueue::is_empty)
    }
}

/// Pure core runtime state.
///
/// It has **no** channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    runs: ActiveRuns,
    options: RuntimeOptions,
}

impl CoreRuntime {
    pub fn new(
        behaviour: TriggerWhileRunningBehaviour,
        queue_length: usize,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            runs: ActiveRuns::new(behaviour, queue_length),
            options,
        }
    }

    /// No run is active (for tests).
    pub fn is_idle(&self) -> bool {
        self.runs.is_idle()
    }

    pub fn is_running(&self, workflow: &str) -> bool {
        self.runs.running.contains(workflow)
    }

    /// Requests waiting behind the active run of `workflow`.
    pub fn queued(&self, workflow: &str) -> usize {
        self.runs.queues.get(workflow).map_or(0, RunQueue::len)
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::RunRequested(request) => handle_run_requested(&mut self.runs, request),
            RuntimeEvent::RunFinished { workflow, status } => {
                handle_run_finished(&mut self.runs, &self.options, workflow, status)
            }
            RuntimeEvent::ShutdownRequested => handle_shutdown(&mut self.runs),
        }
    }
}
