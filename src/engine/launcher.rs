// src/engine/launcher.rs

//! How the runtime turns a [`RunRequest`] into a workflow run.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use crate::cancel::CancelToken;
use crate::dag::{DagEngine, ExecutionStatus, RunOptions, Workflow};
use crate::engine::RunRequest;
use crate::errors::{Result, StevedoreError};
use crate::exec::TaskExecutor;
use crate::types::{RunTrigger, WorkflowName};

/// Trait abstracting how a requested run is executed.
///
/// Production code uses [`WorkflowLauncher`]; tests can provide a launcher
/// that records requests and finishes immediately.
pub trait RunLauncher: Send + Sync {
    /// Run to completion. `Ok(None)` means the request was deliberately not
    /// run (e.g. a scheduled run of a disabled workflow).
    fn launch(
        &self,
        request: RunRequest,
        cancel: CancelToken,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ExecutionStatus>>> + Send + '_>>;
}

/// Launches runs of configured workflows on a [`DagEngine`].
pub struct WorkflowLauncher<E: TaskExecutor> {
    engine: Arc<DagEngine<E>>,
    workflows: BTreeMap<WorkflowName, Workflow>,
}

impl<E: TaskExecutor + 'static> WorkflowLauncher<E> {
    pub fn new(engine: Arc<DagEngine<E>>, workflows: BTreeMap<WorkflowName, Workflow>) -> Self {
        Self { engine, workflows }
    }

    async fn launch_inner(
        &self,
        request: RunRequest,
        cancel: CancelToken,
    ) -> Result<Option<ExecutionStatus>> {
        let workflow = self
            .workflows
            .get(&request.workflow)
            .ok_or_else(|| StevedoreError::WorkflowNotFound(request.workflow.clone()))?;

        if !workflow.enabled && request.trigger == RunTrigger::Schedule {
            info!(workflow = %workflow.name, "workflow disabled; skipping scheduled run");
            return Ok(None);
        }

        let opts = RunOptions::triggered(request.trigger, request.logical_time).with_cancel(cancel);
        let outcome = self.engine.run(workflow, opts).await?;
        Ok(outcome.execution().map(|e| e.status))
    }
}

impl<E: TaskExecutor + 'static> RunLauncher for WorkflowLauncher<E> {
    fn launch(
        &self,
        request: RunRequest,
        cancel: CancelToken,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ExecutionStatus>>> + Send + '_>> {
        Box::pin(self.launch_inner(request, cancel))
    }
}
