// src/dag/engine.rs

//! Executes one workflow run.
//!
//! Layers run one after another with a full barrier between them; tasks of
//! a layer run concurrently, bounded by a per-run semaphore. Each task owns
//! its retry loop. Failures never abort the run: dependents of a task that
//! did not succeed are skipped and independent branches continue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::dag::execution::{Execution, FailureEvent, TaskRecord};
use crate::dag::graph::validate;
use crate::dag::history::record_execution;
use crate::dag::retry::BackoffPolicy;
use crate::dag::run_state::RunTracker;
use crate::dag::task_state::{TaskEvent, TaskState};
use crate::dag::workflow::{Task, Workflow};
use crate::errors::{Result, StevedoreError};
use crate::exec::{AttemptOutcome, TaskAttempt, TaskExecutor};
use crate::image::ImageStore;
use crate::store::{RecordKind, StateStore};
use crate::types::{ExecutionMode, RunTrigger, TaskName, WorkflowName};

/// Engine-wide knobs taken from `[config]`.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Concurrent attempts per run.
    pub parallelism: usize,
    pub backoff: BackoffPolicy,
    pub history_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            backoff: BackoffPolicy::default(),
            history_limit: 100,
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: ExecutionMode,
    pub trigger: RunTrigger,
    pub logical_time: Option<DateTime<Utc>>,
    pub cancel: CancelToken,
}

impl RunOptions {
    pub fn manual() -> Self {
        Self {
            mode: ExecutionMode::Normal,
            trigger: RunTrigger::Manual,
            logical_time: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn dry_run() -> Self {
        Self {
            mode: ExecutionMode::DryRun,
            ..Self::manual()
        }
    }

    pub fn triggered(trigger: RunTrigger, logical_time: Option<DateTime<Utc>>) -> Self {
        Self {
            trigger,
            logical_time,
            ..Self::manual()
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What a dry run found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunReport {
    pub workflow: WorkflowName,
    pub layers: Vec<Vec<TaskName>>,
    /// Static problems that would make tasks fail at launch.
    pub issues: Vec<String>,
}

impl DryRunReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    DryRun(DryRunReport),
    Executed(Execution),
}

impl RunOutcome {
    pub fn execution(&self) -> Option<&Execution> {
        match self {
            RunOutcome::Executed(e) => Some(e),
            RunOutcome::DryRun(_) => None,
        }
    }

    pub fn into_execution(self) -> Option<Execution> {
        match self {
            RunOutcome::Executed(e) => Some(e),
            RunOutcome::DryRun(_) => None,
        }
    }
}

/// Runs workflows against a [`TaskExecutor`].
pub struct DagEngine<E: TaskExecutor> {
    executor: Arc<E>,
    store: StateStore,
    settings: EngineSettings,
    images: Option<Arc<ImageStore>>,
    notifier: Option<mpsc::UnboundedSender<FailureEvent>>,
}

impl<E: TaskExecutor> std::fmt::Debug for DagEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Everything a task future needs, shared across the tasks of a run.
struct RunContext<E: TaskExecutor> {
    executor: Arc<E>,
    store: StateStore,
    semaphore: Arc<Semaphore>,
    backoff: BackoffPolicy,
    workflow: WorkflowName,
    execution_id: String,
    cancel: CancelToken,
}

impl<E: TaskExecutor + 'static> DagEngine<E> {
    pub fn new(executor: Arc<E>, store: StateStore, settings: EngineSettings) -> Self {
        Self {
            executor,
            store,
            settings,
            images: None,
            notifier: None,
        }
    }

    /// Let dry runs check that task images exist.
    pub fn with_images(mut self, images: Arc<ImageStore>) -> Self {
        self.images = Some(images);
        self
    }

    /// Deliver a [`FailureEvent`] for every task whose retries ran out and
    /// that has an `on_failure` hook.
    pub fn with_notifier(mut self, tx: mpsc::UnboundedSender<FailureEvent>) -> Self {
        self.notifier = Some(tx);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate, plan and (unless dry-running) execute `workflow`.
    ///
    /// Validation errors are returned as `Err`; task failures are recorded
    /// in the returned [`Execution`].
    pub async fn run(&self, workflow: &Workflow, opts: RunOptions) -> Result<RunOutcome> {
        let graph = validate(workflow)?;
        let layers = graph.layers()?;

        if opts.mode == ExecutionMode::DryRun {
            let report = self.dry_run(workflow, layers);
            info!(
                workflow = %workflow.name,
                layers = report.layers.len(),
                issues = report.issues.len(),
                "dry run complete"
            );
            return Ok(RunOutcome::DryRun(report));
        }

        self.store
            .write_record(RecordKind::Workflow, &workflow.name, workflow)?;

        let started_at = Utc::now();
        let execution_id = new_execution_id(started_at);
        info!(
            workflow = %workflow.name,
            run_id = %execution_id,
            trigger = %opts.trigger,
            tasks = graph.len(),
            "run started"
        );

        let ctx = Arc::new(RunContext {
            executor: Arc::clone(&self.executor),
            store: self.store.clone(),
            semaphore: Arc::new(Semaphore::new(self.settings.parallelism.max(1))),
            backoff: self.settings.backoff,
            workflow: workflow.name.clone(),
            execution_id: execution_id.clone(),
            cancel: opts.cancel.clone(),
        });

        let tasks: HashMap<&str, &Task> =
            workflow.tasks.iter().map(|t| (t.name.as_str(), t)).collect();
        let mut tracker = RunTracker::new(&graph);
        let mut failure_events = Vec::new();

        for (depth, layer) in layers.iter().enumerate() {
            if opts.cancel.is_cancelled() {
                break;
            }
            let layer_start = Instant::now();
            let mut set = JoinSet::new();
            let mut names = HashMap::new();

            for name in layer {
                if tracker.state_of(name) != Some(TaskState::Pending) {
                    continue;
                }
                if let Some(dep) = tracker.blocking_dependency(name) {
                    tracker.skip(name, format!("upstream task '{dep}' did not succeed"));
                    continue;
                }
                let Some(task) = tasks.get(name.as_str()) else {
                    continue;
                };
                let handle = set.spawn(run_task(Arc::clone(&ctx), (*task).clone(), layer_start));
                names.insert(handle.id(), name.clone());
            }
            debug!(workflow = %workflow.name, depth, started = names.len(), "layer dispatched");

            while let Some(joined) = set.join_next_with_id().await {
                let record = match joined {
                    Ok((_, record)) => record,
                    Err(e) => {
                        let name = names.get(&e.id()).cloned().unwrap_or_default();
                        error!(task = %name, error = %e, "task future aborted");
                        TaskRecord {
                            state: TaskState::Failed,
                            error: Some(format!("task aborted: {e}")),
                            finished_at: Some(Utc::now()),
                            ..TaskRecord::pending(name)
                        }
                    }
                };

                if let Some(hook) = &record.failure_hook {
                    let event = FailureEvent {
                        workflow: workflow.name.clone(),
                        execution_id: execution_id.clone(),
                        task: record.task.clone(),
                        reason: record.error.clone().unwrap_or_default(),
                        hook: hook.clone(),
                    };
                    warn!(task = %event.task, hook = %event.hook, "failure hook due");
                    if let Some(tx) = &self.notifier {
                        if tx.send(event.clone()).is_err() {
                            debug!(task = %event.task, "failure notifier closed; event kept on the execution only");
                        }
                    }
                    failure_events.push(event);
                }

                let name = record.task.clone();
                let succeeded = record.state == TaskState::Succeeded;
                tracker.finish(record);
                if !succeeded {
                    let skipped = tracker.mark_dependents_skipped(&name);
                    if !skipped.is_empty() {
                        info!(task = %name, skipped = ?skipped, "skipping dependents");
                    }
                }
            }
        }

        let cancelled = opts.cancel.is_cancelled();
        if cancelled {
            let skipped = tracker.skip_remaining("run cancelled");
            warn!(workflow = %workflow.name, run_id = %execution_id, skipped = skipped.len(), "run cancelled");
        }

        let status = tracker.status();
        let execution = Execution {
            id: execution_id,
            workflow: workflow.name.clone(),
            trigger: opts.trigger,
            logical_time: opts.logical_time,
            started_at,
            finished_at: Utc::now(),
            status,
            cancelled,
            tasks: tracker.into_records(),
            failure_events,
        };
        record_execution(&self.store, self.settings.history_limit, execution.clone())?;

        info!(
            workflow = %execution.workflow,
            run_id = %execution.id,
            status = %execution.status,
            duration = ?execution.duration(),
            "run finished"
        );
        Ok(RunOutcome::Executed(execution))
    }

    fn dry_run(&self, workflow: &Workflow, layers: Vec<Vec<TaskName>>) -> DryRunReport {
        let mut issues = Vec::new();
        for task in &workflow.tasks {
            if task.command.is_empty() {
                issues.push(format!("task '{}' has an empty command", task.name));
            }
            if task.limits.cpu_percent.is_some_and(|p| p == 0 || p > 100) {
                issues.push(format!("task '{}' has a cpu limit outside 1-100%", task.name));
            }
            if task.limits.memory_bytes == Some(0) {
                issues.push(format!("task '{}' has a zero memory limit", task.name));
            }
            if task.timeout == Some(Duration::ZERO) {
                issues.push(format!("task '{}' has a zero timeout", task.name));
            }
            if let Some(images) = &self.images {
                if let Err(e) = images.get(&task.image) {
                    issues.push(format!("task '{}': {e}", task.name));
                }
            }
        }
        DryRunReport {
            workflow: workflow.name.clone(),
            layers,
            issues,
        }
    }
}

fn new_execution_id(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", at.format("%Y%m%dT%H%M%S"), &suffix[..8])
}

fn advance(task: &str, state: TaskState, event: TaskEvent) -> TaskState {
    match state.on(event) {
        Some(next) => next,
        None => {
            debug!(task, %state, ?event, "ignoring invalid task transition");
            state
        }
    }
}

/// Run every attempt of one task and produce its final record.
async fn run_task<E: TaskExecutor + 'static>(
    ctx: Arc<RunContext<E>>,
    task: Task,
    layer_start: Instant,
) -> TaskRecord {
    let mut record = TaskRecord::pending(&task.name);
    let mut state = TaskState::Pending;
    let mut first_start: Option<Instant> = None;

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&ctx.semaphore).acquire_owned() => permit,
            _ = ctx.cancel.cancelled() => {
                state = advance(&task.name, state, TaskEvent::Skip);
                record.error = Some("run cancelled".to_string());
                break;
            }
        };
        let Ok(permit) = permit else {
            state = advance(&task.name, state, TaskEvent::Skip);
            record.error = Some("run aborted".to_string());
            break;
        };

        state = advance(&task.name, state, TaskEvent::Start);
        first_start.get_or_insert_with(Instant::now);
        record.started_at.get_or_insert_with(Utc::now);
        record.attempts += 1;
        let attempt_no = record.attempts;

        let attempt = TaskAttempt {
            workflow: ctx.workflow.clone(),
            execution_id: ctx.execution_id.clone(),
            task: task.clone(),
            attempt: attempt_no,
            log_path: ctx
                .store
                .log_path(&ctx.workflow, &task.name, &ctx.execution_id, attempt_no),
        };
        debug!(task = %task.name, attempt = attempt_no, "attempt starting");
        let report = ctx.executor.run_attempt(attempt, ctx.cancel.clone()).await;
        drop(permit);

        record.exit_code = report.outcome.exit_code();
        record.container_id = report.container_id.clone();

        match report.outcome {
            AttemptOutcome::Succeeded { .. } => {
                state = advance(&task.name, state, TaskEvent::Succeed);
                record.error = None;
                info!(task = %task.name, attempt = attempt_no, "task succeeded");
                break;
            }
            AttemptOutcome::Cancelled => {
                state = advance(&task.name, state, TaskEvent::Fail { retry_after: None });
                record.error = Some("cancelled".to_string());
                break;
            }
            outcome => {
                let reason = outcome.reason().unwrap_or_default();
                if attempt_no < task.max_attempts() {
                    let delay = ctx.backoff.delay_for(task.retry_delay, attempt_no);
                    state = advance(&task.name, state, TaskEvent::Fail { retry_after: Some(delay) });
                    record.error = Some(reason.clone());
                    warn!(
                        task = %task.name,
                        attempt = attempt_no,
                        ?delay,
                        %reason,
                        "attempt failed; retry scheduled"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = ctx.cancel.cancelled() => {
                            state = advance(&task.name, state, TaskEvent::Skip);
                            record.error = Some(format!("run cancelled while waiting to retry: {reason}"));
                            break;
                        }
                    }
                }

                state = advance(&task.name, state, TaskEvent::Fail { retry_after: None });
                let err = StevedoreError::RetriesExhausted {
                    task: task.name.clone(),
                    attempts: attempt_no,
                    reason,
                };
                warn!(task = %task.name, error = %err, "task failed");
                record.error = Some(err.to_string());
                record.failure_hook = task.on_failure.clone();
                break;
            }
        }
    }

    record.state = state;
    record.finished_at = Some(Utc::now());
    record.duration = first_start.map(|t| t.elapsed()).unwrap_or_default();

    if let Some(sla) = task.sla {
        let elapsed = layer_start.elapsed();
        if elapsed > sla && first_start.is_some() {
            record.sla_breached = true;
            let breach = StevedoreError::SlaBreach {
                task: task.name.clone(),
                sla,
                elapsed,
            };
            warn!(task = %task.name, "{breach}");
        }
    }

    record
}
