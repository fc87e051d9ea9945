// src/exec/task_runner.rs

//! Runs task attempts as containers.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::container::{
    ContainerRuntime, ContainerSpec, ContainerStatus, LABEL_EXECUTION, LABEL_TASK,
    LABEL_WORKFLOW,
};
use crate::errors::StevedoreError;
use crate::exec::backend::{AttemptOutcome, AttemptReport, TaskAttempt, TaskExecutor};

/// Executes each attempt in a fresh container.
///
/// Successful containers are deleted right away. Failed ones are kept for
/// inspection until the next attempt of the same task starts.
#[derive(Debug, Clone)]
pub struct ContainerTaskExecutor {
    runtime: ContainerRuntime,
}

impl ContainerTaskExecutor {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Delete leftover containers from earlier failed attempts of this task.
    async fn remove_stale(&self, attempt: &TaskAttempt) {
        let Ok(containers) = self.runtime.list() else {
            return;
        };
        for c in containers {
            let same_task = c.labels.get(LABEL_WORKFLOW) == Some(&attempt.workflow)
                && c.labels.get(LABEL_TASK) == Some(&attempt.task.name);
            if same_task && c.status.is_terminal() {
                debug!(task = %attempt.task.name, container = %c.id, "removing container of earlier attempt");
                if let Err(e) = self.runtime.delete(&c.id).await {
                    warn!(container = %c.id, error = %e, "could not remove stale container");
                }
            }
        }
    }

    async fn run(&self, attempt: TaskAttempt, cancel: CancelToken) -> AttemptReport {
        let task = &attempt.task;
        self.remove_stale(&attempt).await;

        let labels = BTreeMap::from([
            (LABEL_WORKFLOW.to_string(), attempt.workflow.clone()),
            (LABEL_TASK.to_string(), task.name.clone()),
            (LABEL_EXECUTION.to_string(), attempt.execution_id.clone()),
        ]);
        let spec = ContainerSpec {
            image: task.image.clone(),
            command: task.command.clone(),
            env: task.env.clone(),
            limits: task.limits,
            labels,
            log_path: Some(attempt.log_path.clone()),
            ..Default::default()
        };

        let container = match self.runtime.create(spec).await {
            Ok(c) => c,
            Err(e) => {
                return AttemptOutcome::LaunchFailed {
                    reason: e.to_string(),
                }
                .into();
            }
        };
        let id = container.id.clone();

        if let Err(e) = self.runtime.start(&id).await {
            return AttemptReport::from(AttemptOutcome::LaunchFailed {
                reason: e.to_string(),
            })
            .with_container(id);
        }

        let started = Instant::now();
        info!(
            task = %task.name,
            attempt = attempt.attempt,
            container = %id,
            "task attempt started"
        );

        let waited = tokio::select! {
            res = self.runtime.wait(&id, task.timeout) => Some(res),
            _ = cancel.cancelled() => None,
        };

        let outcome = match waited {
            None => {
                info!(task = %task.name, container = %id, "run cancelled; killing attempt");
                self.kill_and_delete(&id).await;
                return AttemptOutcome::Cancelled.into();
            }
            Some(Err(StevedoreError::TimeoutExceeded { duration, .. })) => {
                warn!(task = %task.name, container = %id, ?duration, "task attempt timed out");
                if let Err(e) = self.runtime.kill(&id).await {
                    warn!(container = %id, error = %e, "kill after timeout failed");
                }
                AttemptOutcome::TimedOut { duration }
            }
            Some(Err(e)) => AttemptOutcome::Failed {
                exit_code: None,
                reason: e.to_string(),
                duration: started.elapsed(),
            },
            Some(Ok(exit)) => match exit.status {
                ContainerStatus::Succeeded => AttemptOutcome::Succeeded {
                    exit_code: exit.exit_code.unwrap_or(0),
                    duration: exit.duration,
                },
                status => AttemptOutcome::Failed {
                    exit_code: exit.exit_code,
                    reason: match exit.exit_code {
                        Some(code) => format!("exited with code {code}"),
                        None => format!("container {status}"),
                    },
                    duration: exit.duration,
                },
            },
        };

        if outcome.is_success() {
            if let Err(e) = self.runtime.delete(&id).await {
                warn!(container = %id, error = %e, "could not delete finished container");
            }
            return outcome.into();
        }
        AttemptReport::from(outcome).with_container(id)
    }

    async fn kill_and_delete(&self, id: &str) {
        if let Err(e) = self.runtime.delete(id).await {
            warn!(container = %id, error = %e, "could not delete cancelled container");
        }
    }
}

impl TaskExecutor for ContainerTaskExecutor {
    fn run_attempt(
        &self,
        attempt: TaskAttempt,
        cancel: CancelToken,
    ) -> Pin<Box<dyn Future<Output = AttemptReport> + Send + '_>> {
        Box::pin(self.run(attempt, cancel))
    }
}
