// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::errors::Result;
use crate::types::WorkflowName;

use super::core::CoreRuntime;
use super::launcher::RunLauncher;
use super::{CoreCommand, RunRequest, RuntimeEvent};

/// Launches runs in response to `RuntimeEvent`s.
///
/// This is a pure IO shell around `CoreRuntime`, which contains all the
/// runtime semantics. This struct handles async IO: reading events from
/// channels, spawning runs on the launcher, and feeding their completion
/// back in as `RunFinished`.
pub struct Runtime<L: RunLauncher + 'static> {
    core: CoreRuntime,
    event_tx: mpsc::Sender<RuntimeEvent>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    launcher: Arc<L>,
    cancels: HashMap<WorkflowName, CancelToken>,
    runs: JoinSet<()>,
}

impl<L: RunLauncher + 'static> fmt::Debug for Runtime<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("active", &self.cancels.len())
            .finish_non_exhaustive()
    }
}

impl<L: RunLauncher + 'static> Runtime<L> {
    /// `event_tx` must feed `event_rx`; the runtime uses it to report
    /// finished runs to itself.
    pub fn new(
        core: CoreRuntime,
        event_tx: mpsc::Sender<RuntimeEvent>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        launcher: Arc<L>,
    ) -> Self {
        Self {
            core,
            event_tx,
            event_rx,
            launcher,
            cancels: HashMap::new(),
            runs: JoinSet::new(),
        }
    }

    /// Main event loop.
    ///
    /// - Consumes `RuntimeEvent`s from `event_rx`.
    /// - Feeds them into the core runtime.
    /// - Executes commands returned by the core (start, cancel, exit).
    pub async fn run(mut self) -> Result<()> {
        info!("stevedore runtime started");

        while let Some(event) = self.event_rx.recv().await {
            debug!(?event, "runtime received event");
            if let RuntimeEvent::RunFinished { workflow, .. } = &event {
                self.cancels.remove(workflow);
            }

            let step = self.core.step(event);
            for command in step.commands {
                self.execute_command(command);
            }

            if !step.keep_running {
                info!("core requested exit; stopping runtime");
                break;
            }
        }

        let Runtime {
            event_rx,
            cancels,
            mut runs,
            ..
        } = self;
        drop(event_rx);
        for token in cancels.values() {
            token.cancel();
        }
        while runs.join_next().await.is_some() {}
        info!("runtime exiting");
        Ok(())
    }

    fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::StartRun(request) => self.start_run(request),
            CoreCommand::CancelRun(workflow) => {
                if let Some(token) = self.cancels.get(&workflow) {
                    info!(workflow = %workflow, "cancelling active run");
                    token.cancel();
                }
            }
            CoreCommand::DropRun { request, reason } => {
                warn!(
                    workflow = %request.workflow,
                    trigger = %request.trigger,
                    logical_time = ?request.logical_time,
                    %reason,
                    "run request dropped; it will not run"
                );
            }
            CoreCommand::RequestExit => {
                debug!("core issued RequestExit command");
            }
        }
    }

    fn start_run(&mut self, request: RunRequest) {
        let cancel = CancelToken::new();
        self.cancels.insert(request.workflow.clone(), cancel.clone());

        let launcher = Arc::clone(&self.launcher);
        let tx = self.event_tx.clone();
        info!(
            workflow = %request.workflow,
            trigger = %request.trigger,
            logical_time = ?request.logical_time,
            "starting run"
        );
        self.runs.spawn(async move {
            let workflow = request.workflow.clone();
            let status = match launcher.launch(request, cancel).await {
                Ok(status) => status,
                Err(e) => {
                    error!(workflow = %workflow, error = %e, "run failed to execute");
                    None
                }
            };
            let _ = tx.send(RuntimeEvent::RunFinished { workflow, status }).await;
        });
    }
}
