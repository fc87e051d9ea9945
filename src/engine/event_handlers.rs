// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use std::fmt;

use tracing::{debug, info};

use crate::dag::ExecutionStatus;
use crate::engine::core::ActiveRuns;
use crate::engine::{RunRequest, RuntimeOptions};
use crate::types::{RunTrigger, TriggerWhileRunningBehaviour, WorkflowName};

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// Launch a run.
    StartRun(RunRequest),
    /// Cancel the active run of a workflow.
    CancelRun(WorkflowName),
    /// A request was discarded and will never run. Scheduled and backfill
    /// requests are already recorded as fired, so this is the only trace
    /// of the lost occurrence.
    DropRun {
        request: RunRequest,
        reason: DropReason,
    },
    /// Request that the process exits.
    RequestExit,
}

/// Why a request was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Pushed out of a full queue by a newer request.
    QueueFull,
    /// Replaced by a newer request in cancel mode.
    Superseded,
    /// Still queued, or arriving, at shutdown.
    Shutdown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::QueueFull => "queue full",
            DropReason::Superseded => "superseded",
            DropReason::Shutdown => "shutdown",
        })
    }
}

fn dropped(requests: Vec<RunRequest>, reason: DropReason) -> impl Iterator<Item = CoreCommand> {
    requests
        .into_iter()
        .map(move |request| CoreCommand::DropRun { request, reason })
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    fn running(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }
}

/// Handle a run request.
///
/// - If the workflow is idle, the run starts immediately.
/// - Otherwise the request is queued. In cancel mode a non-backfill request
///   also cancels the active run so the newest request runs next.
pub fn handle_run_requested(runs: &mut ActiveRuns, request: RunRequest) -> CoreStep {
    if runs.shutting_down {
        debug!(workflow = %request.workflow, "shutting down; ignoring run request");
        return CoreStep::running(dropped(vec![request], DropReason::Shutdown).collect());
    }

    if !runs.running.contains(&request.workflow) {
        runs.running.insert(request.workflow.clone());
        return CoreStep::running(vec![CoreCommand::StartRun(request)]);
    }

    let workflow = request.workflow.clone();
    let cancels = runs.behaviour() == TriggerWhileRunningBehaviour::Cancel
        && request.trigger != RunTrigger::Backfill;
    let pushed_out = runs.queue_for(&workflow).record(request);
    debug!(workflow = %workflow, queued = runs.queue_for(&workflow).len(), "workflow busy; request queued");

    let reason = match runs.behaviour() {
        TriggerWhileRunningBehaviour::Queue => DropReason::QueueFull,
        TriggerWhileRunningBehaviour::Cancel => DropReason::Superseded,
    };
    let mut commands: Vec<CoreCommand> = dropped(pushed_out, reason).collect();
    if cancels {
        info!(workflow = %workflow, "newer request arrived; cancelling active run");
        commands.push(CoreCommand::CancelRun(workflow));
    }
    CoreStep::running(commands)
}

/// Handle the end of a run: start the next queued request, or exit when
/// asked to once everything is idle.
pub fn handle_run_finished(
    runs: &mut ActiveRuns,
    options: &RuntimeOptions,
    workflow: WorkflowName,
    status: Option<ExecutionStatus>,
) -> CoreStep {
    runs.running.remove(&workflow);
    debug!(workflow = %workflow, status = ?status, "run finished");

    let mut commands = Vec::new();
    if !runs.shutting_down {
        if let Some(next) = runs.queue_for(&workflow).pop_next() {
            runs.running.insert(workflow.clone());
            commands.push(CoreCommand::StartRun(next));
        }
    }

    let idle = runs.is_idle() && runs.queues_empty();
    if (runs.shutting_down && runs.is_idle()) || (options.exit_when_idle && idle) {
        commands.push(CoreCommand::RequestExit);
        return CoreStep {
            commands,
            keep_running: false,
        };
    }
    CoreStep::running(commands)
}

/// Handle a shutdown request: drop queued work and cancel active runs.
/// The loop keeps running until every active run has reported back.
pub fn handle_shutdown(runs: &mut ActiveRuns) -> CoreStep {
    runs.shutting_down = true;
    let discarded: Vec<RunRequest> = runs.queues.values_mut().flat_map(|q| q.clear()).collect();
    if !discarded.is_empty() {
        info!(dropped = discarded.len(), "discarding queued runs on shutdown");
    }
    let mut commands: Vec<CoreCommand> = dropped(discarded, DropReason::Shutdown).collect();

    if runs.is_idle() {
        commands.push(CoreCommand::RequestExit);
        return CoreStep {
            commands,
            keep_running: false,
        };
    }
    commands.extend(runs.running.iter().cloned().map(CoreCommand::CancelRun));
    CoreStep::running(commands)
}
