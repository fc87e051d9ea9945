// src/lib.rs

pub mod cancel;
pub mod cli;
pub mod config;
pub mod container;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod image;
pub mod logging;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::cli::{CliArgs, Command, ImageCommand};
use crate::config::{ConfigFile, load_and_validate};
use crate::container::{ContainerRuntime, RuntimeSettings, detect_backend};
use crate::dag::{
    DagEngine, EngineSettings, ExecutionStatus, FailureEvent, RunOptions, RunOutcome, Workflow,
    load_history, plan,
};
use crate::engine::{CoreRuntime, Runtime, RuntimeEvent, RuntimeOptions, WorkflowLauncher};
use crate::errors::StevedoreError;
use crate::exec::ContainerTaskExecutor;
use crate::image::{ImageStore, PrunePolicy, parse_reference};
use crate::scheduler::{Scheduler, SchedulerDaemon};
use crate::service::ServiceManager;
use crate::store::{RecordKind, StateStore};
use crate::types::ExecutionMode;

/// How often service restart policies are applied by the daemon.
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(5);

/// Opened state store plus the runtimes built on it.
struct Stack {
    config: ConfigFile,
    store: StateStore,
    images: Arc<ImageStore>,
    containers: ContainerRuntime,
}

impl Stack {
    fn open(config: ConfigFile) -> Result<Self> {
        let store = StateStore::open(&config.settings.state_dir)
            .with_context(|| format!("opening state dir {}", config.settings.state_dir.display()))?;
        let images = Arc::new(ImageStore::new(store.clone()));
        let settings = RuntimeSettings {
            port_range: config.settings.port_range,
            port_attempts: config.settings.port_attempts,
            ..RuntimeSettings::default()
        };
        let containers = ContainerRuntime::new(
            store.clone(),
            Arc::clone(&images),
            detect_backend(config.settings.isolation),
            settings,
        );
        Ok(Self {
            config,
            store,
            images,
            containers,
        })
    }

    fn engine(&self) -> DagEngine<ContainerTaskExecutor> {
        let executor = Arc::new(ContainerTaskExecutor::new(self.containers.clone()));
        let settings = EngineSettings {
            parallelism: self.config.settings.parallelism,
            backoff: self.config.settings.backoff,
            history_limit: self.config.settings.history_limit,
        };
        DagEngine::new(executor, self.store.clone(), settings).with_images(Arc::clone(&self.images))
    }

    fn workflow(&self, name: &str) -> Result<&Workflow> {
        self.config
            .workflow(name)
            .ok_or_else(|| StevedoreError::WorkflowNotFound(name.to_string()).into())
    }
}

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let config = load_and_validate(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Command::Validate = args.command {
        print_plans(&config)?;
        return Ok(());
    }

    let stack = Stack::open(config)?;
    match args.command {
        Command::Validate => Ok(()),
        Command::Run { workflow, dry_run } => run_once(&stack, &workflow, dry_run).await,
        Command::Schedule { workflow, cron } => {
            let wf = stack.workflow(&workflow)?;
            let Some(cron) = cron.or_else(|| wf.schedule.clone()) else {
                bail!("workflow '{workflow}' has no schedule; pass a cron expression");
            };
            let scheduler = Scheduler::new(stack.store.clone(), mpsc::channel(1).0);
            let job = scheduler.registry().schedule(&workflow, &cron, Utc::now())?;
            println!(
                "scheduled {workflow} '{}' next fire {}",
                job.cron,
                job.next_fire_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            Ok(())
        }
        Command::Unschedule { workflow } => {
            let scheduler = Scheduler::new(stack.store.clone(), mpsc::channel(1).0);
            if !scheduler.registry().unschedule(&workflow)? {
                bail!(StevedoreError::WorkflowNotFound(workflow));
            }
            println!("unscheduled {workflow}");
            Ok(())
        }
        Command::Pause { workflow } => {
            let scheduler = Scheduler::new(stack.store.clone(), mpsc::channel(1).0);
            scheduler.registry().pause(&workflow)?;
            println!("paused {workflow}");
            Ok(())
        }
        Command::Resume { workflow } => {
            let scheduler = Scheduler::new(stack.store.clone(), mpsc::channel(1).0);
            scheduler.registry().resume(&workflow)?;
            println!("resumed {workflow}");
            Ok(())
        }
        Command::Backfill {
            workflow,
            start,
            end,
        } => backfill(&stack, &workflow, start, end).await,
        Command::Daemon => daemon(stack).await,
        Command::Image(cmd) => image_command(&stack, cmd),
        Command::Ps { all, watch } => ps(&stack.store, all, watch).await,
        Command::History { workflow, limit } => {
            let history = load_history(&stack.store, &workflow)?;
            for e in history.iter().rev().take(limit) {
                println!(
                    "{}  {:<8}  {:<15}  {:>8.1?}  {}",
                    e.id,
                    e.trigger,
                    e.status,
                    e.duration(),
                    e.logical_time.map(|t| t.to_rfc3339()).unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

fn print_plans(config: &ConfigFile) -> Result<()> {
    println!("config ok");
    for (name, wf) in &config.workflows {
        let layers = plan(wf)?;
        let schedule = wf.schedule.as_deref().unwrap_or("-");
        println!("workflow {name} (schedule: {schedule}, {} tasks)", wf.tasks.len());
        for (i, layer) in layers.iter().enumerate() {
            println!("  layer {i}: {}", layer.join(", "));
        }
    }
    for (name, svc) in &config.services {
        println!("service {name} (image: {}, restart: {:?})", svc.image, svc.restart_policy);
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            t.cancel();
        }
    });
    token
}

async fn run_once(stack: &Stack, workflow: &str, dry_run: bool) -> Result<()> {
    let wf = stack.workflow(workflow)?;
    let mut opts = RunOptions::manual().with_cancel(cancel_on_ctrl_c());
    if dry_run {
        opts.mode = ExecutionMode::DryRun;
    }

    match stack.engine().run(wf, opts).await? {
        RunOutcome::DryRun(report) => {
            for (i, layer) in report.layers.iter().enumerate() {
                println!("layer {i}: {}", layer.join(", "));
            }
            for issue in &report.issues {
                println!("issue: {issue}");
            }
            if !report.is_ok() {
                bail!("dry run found {} issue(s)", report.issues.len());
            }
            Ok(())
        }
        RunOutcome::Executed(execution) => {
            for t in &execution.tasks {
                println!(
                    "{:<20}  {:<10}  attempts={}  {}",
                    t.task,
                    t.state.to_string(),
                    t.attempts,
                    t.error.as_deref().unwrap_or("")
                );
            }
            println!("{} {} in {:.1?}", execution.id, execution.status, execution.duration());
            if execution.status != ExecutionStatus::Success {
                bail!("workflow '{workflow}' finished with status {}", execution.status);
            }
            Ok(())
        }
    }
}

/// Enqueue the occurrences and run them one by one, oldest first.
async fn backfill(
    stack: &Stack,
    workflow: &str,
    start: chrono::DateTime<Utc>,
    end: chrono::DateTime<Utc>,
) -> Result<()> {
    let wf = stack.workflow(workflow)?;
    let (tx, mut rx) = mpsc::channel::<RuntimeEvent>(64);
    let collector = tokio::spawn(async move {
        let mut requests = Vec::new();
        while let Some(event) = rx.recv().await {
            if let RuntimeEvent::RunRequested(request) = event {
                requests.push(request);
            }
        }
        requests
    });

    let scheduler = Scheduler::new(stack.store.clone(), tx)
        .with_max_backfill_runs(stack.config.settings.max_backfill_runs);
    let enqueued = scheduler.backfill(workflow, start, end).await?;
    drop(scheduler);
    let requests = collector.await.context("collecting backfill requests")?;
    info!(workflow, runs = enqueued.len(), "running backfill");

    let engine = stack.engine();
    let cancel = cancel_on_ctrl_c();
    let mut failed = 0;
    for request in requests {
        if cancel.is_cancelled() {
            break;
        }
        let opts = RunOptions::triggered(request.trigger, request.logical_time)
            .with_cancel(cancel.clone());
        if let Some(execution) = engine.run(wf, opts).await?.into_execution() {
            println!(
                "{}  {}  {}",
                request
                    .logical_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                execution.id,
                execution.status
            );
            if execution.status != ExecutionStatus::Success {
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} backfill run(s) did not succeed");
    }
    Ok(())
}

async fn daemon(stack: Stack) -> Result<()> {
    let settings = stack.config.settings.clone();
    let repaired = stack.containers.recover()?;
    if repaired > 0 {
        warn!(repaired, "recovered containers orphaned by a previous run");
    }
    let pruned = stack.store.prune_logs(settings.log_retention)?;
    info!(pruned, isolation = stack.containers.isolation_name(), "daemon starting");

    let (tx, rx) = mpsc::channel::<RuntimeEvent>(256);
    let shutdown = CancelToken::new();

    let scheduler = Scheduler::new(stack.store.clone(), tx.clone());
    for (name, wf) in &stack.config.workflows {
        if let Some(cron) = &wf.schedule {
            scheduler.registry().schedule(name, cron, Utc::now())?;
        }
    }
    let scheduler_task = SchedulerDaemon::spawn(scheduler, settings.tick_interval, shutdown.clone());

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<FailureEvent>();
    tokio::spawn(async move {
        while let Some(event) = notify_rx.recv().await {
            warn!(
                workflow = %event.workflow,
                run_id = %event.execution_id,
                task = %event.task,
                hook = %event.hook,
                reason = %event.reason,
                "on_failure notification"
            );
        }
    });

    let engine = Arc::new(stack.engine().with_notifier(notify_tx));
    let launcher = Arc::new(WorkflowLauncher::new(engine, stack.config.workflows.clone()));

    let services = Arc::new(ServiceManager::new(
        stack.containers.clone(),
        stack.config.services.clone(),
    ));
    for name in stack.config.services.keys() {
        if let Err(e) = services.up(name).await {
            warn!(service = %name, error = %e, "service failed to start");
        }
    }
    let supervisor = Arc::clone(&services).supervise(SUPERVISE_INTERVAL, shutdown.clone());

    {
        let tx = tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }

    let core = CoreRuntime::new(
        settings.triggered_while_running_behaviour,
        settings.queue_length,
        RuntimeOptions::default(),
    );
    Runtime::new(core, tx, rx, launcher).run().await?;

    shutdown.cancel();
    let _ = scheduler_task.await;
    let _ = supervisor.await;
    for name in stack.config.services.keys() {
        if let Err(e) = services.down(name).await {
            warn!(service = %name, error = %e, "service failed to stop");
        }
    }

    let prune = PrunePolicy {
        max_unused_age: settings.image_retention,
        keep_last: settings.keep_last_images,
        in_use: stack.containers.images_in_use()?,
    };
    stack.images.prune(&prune, Utc::now())?;
    info!("daemon stopped");
    Ok(())
}

fn print_containers(store: &StateStore, all: bool) -> Result<()> {
    let mut containers = store.snapshot()?.containers;
    containers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    for c in containers {
        if !all && c.status.is_terminal() {
            continue;
        }
        let ports: Vec<String> = c
            .ports
            .iter()
            .map(|p| format!("{}->{}", p.host_port, p.container_port))
            .collect();
        println!(
            "{:<12}  {:<24}  {:<9}  {:<6}  {}",
            c.id,
            c.image,
            c.status,
            c.exit_code.map(|e| e.to_string()).unwrap_or_default(),
            ports.join(",")
        );
    }
    Ok(())
}

async fn ps(store: &StateStore, all: bool, watch: bool) -> Result<()> {
    print_containers(store, all)?;
    if !watch {
        return Ok(());
    }

    let mut changes = store.subscribe()?;
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) if change.kind == RecordKind::Container => {
                    println!();
                    print_containers(store, all)?;
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn image_command(stack: &Stack, cmd: ImageCommand) -> Result<()> {
    match cmd {
        ImageCommand::Import { archive, reference } => {
            let (name, tag) = parse_reference(&reference);
            let image = stack.images.import(&archive, &name, &tag)?;
            println!("{}  {}", image.reference(), image.digest);
        }
        ImageCommand::List => {
            let mut images = stack.images.list()?;
            images.sort_by(|a, b| a.reference().cmp(&b.reference()));
            for i in images {
                println!(
                    "{:<32}  {}  {:>12}  {}",
                    i.reference(),
                    &i.digest[..12.min(i.digest.len())],
                    i.size_bytes,
                    i.last_used.to_rfc3339()
                );
            }
        }
        ImageCommand::Rm { reference } => {
            let freed = stack.images.delete(&reference)?;
            println!("removed {reference} ({freed} bytes freed)");
        }
        ImageCommand::Prune => {
            let policy = PrunePolicy {
                max_unused_age: stack.config.settings.image_retention,
                keep_last: stack.config.settings.keep_last_images,
                in_use: stack.containers.images_in_use()?,
            };
            let report = stack.images.prune(&policy, Utc::now())?;
            for r in &report.removed {
                println!("removed {r}");
            }
            println!("{} bytes freed", report.freed_bytes);
        }
    }
    Ok(())
}
