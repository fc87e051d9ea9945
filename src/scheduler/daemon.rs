// src/scheduler/daemon.rs

//! Tick loop that turns due cron jobs into run requests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::engine::{RunRequest, RuntimeEvent};
use crate::errors::{Result, StevedoreError};
use crate::scheduler::registry::JobRegistry;
use crate::store::StateStore;

/// Cron front-end of the orchestrator.
///
/// Every fire and every backfill occurrence is persisted before its run
/// request is sent, so a crash can lose a request but never duplicate one.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub(crate) registry: JobRegistry,
    pub(crate) runtime_tx: mpsc::Sender<RuntimeEvent>,
    pub(crate) max_backfill_runs: usize,
}

/// Window cap used when none is configured.
pub const DEFAULT_MAX_BACKFILL_RUNS: usize = 1000;

impl Scheduler {
    pub fn new(store: StateStore, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            registry: JobRegistry::new(store),
            runtime_tx,
            max_backfill_runs: DEFAULT_MAX_BACKFILL_RUNS,
        }
    }

    /// Cap on the occurrences a single backfill window may contain.
    pub fn with_max_backfill_runs(mut self, max_runs: usize) -> Self {
        self.max_backfill_runs = max_runs;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Fire every job due at `now`. Returns the number of requests sent.
    ///
    /// If the registry cannot be persisted nothing is sent; the jobs stay
    /// due and are retried on the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let fires = self.registry.claim_due(now)?;
        let count = fires.len();

        for fire in fires {
            info!(
                workflow = %fire.workflow,
                logical_time = %fire.logical_time,
                "cron fire"
            );
            self.enqueue(RunRequest::scheduled(fire.workflow, fire.logical_time))
                .await?;
        }
        Ok(count)
    }

    /// Enqueue a manual run of `workflow` right away.
    pub async fn trigger_now(&self, workflow: &str) -> Result<()> {
        info!(workflow, "manual trigger");
        self.enqueue(RunRequest::manual(workflow)).await
    }

    pub(crate) async fn enqueue(&self, request: RunRequest) -> Result<()> {
        self.runtime_tx
            .send(RuntimeEvent::RunRequested(request))
            .await
            .map_err(|e| StevedoreError::Other(anyhow::anyhow!("runtime channel closed: {e}")))
    }
}

/// Background driver for [`Scheduler::tick`].
pub struct SchedulerDaemon;

impl SchedulerDaemon {
    /// Tick every `interval` until `shutdown` is cancelled.
    pub fn spawn(scheduler: Scheduler, interval: Duration, shutdown: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = scheduler.registry.load() {
                warn!(error = %e, "could not load scheduler registry; continuing");
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(?interval, "scheduler daemon started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scheduler.tick(Utc::now()).await {
                            Ok(0) => {}
                            Ok(n) => debug!(fired = n, "scheduler tick"),
                            Err(e @ StevedoreError::SchedulerPersistenceError(_)) => {
                                warn!(error = %e, "scheduler tick skipped; will retry");
                            }
                            Err(e) => {
                                warn!(error = %e, "scheduler tick failed");
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("scheduler daemon stopped");
        })
    }
}
