use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stevedore::cancel::CancelToken;
use stevedore::dag::ExecutionStatus;
use stevedore::engine::{RunLauncher, RunRequest};
use stevedore::errors::Result;

/// A fake launcher that:
/// - records every request it is asked to run, and whether it was cancelled
/// - "runs" for a fixed duration (or until cancelled) and reports success.
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    run_for: Duration,
    launched: Arc<Mutex<Vec<RunRequest>>>,
    cancelled: Arc<Mutex<Vec<RunRequest>>>,
}

impl RecordingLauncher {
    pub fn new(run_for: Duration) -> Self {
        Self {
            run_for,
            ..Self::default()
        }
    }

    pub fn launched(&self) -> Vec<RunRequest> {
        self.launched.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<RunRequest> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl RunLauncher for RecordingLauncher {
    fn launch(
        &self,
        request: RunRequest,
        cancel: CancelToken,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ExecutionStatus>>> + Send + '_>> {
        Box::pin(async move {
            self.launched.lock().unwrap().push(request.clone());
            tokio::select! {
                _ = tokio::time::sleep(self.run_for) => Ok(Some(ExecutionStatus::Success)),
                _ = cancel.cancelled() => {
                    self.cancelled.lock().unwrap().push(request);
                    Ok(Some(ExecutionStatus::Failed))
                }
            }
        })
    }
}
