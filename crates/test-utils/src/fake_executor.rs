use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use stevedore::cancel::CancelToken;
use stevedore::exec::{AttemptOutcome, AttemptReport, TaskAttempt, TaskExecutor};

/// One attempt as seen by [`ScriptedExecutor`].
#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    pub task: String,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Instant,
}

/// A fake executor that:
/// - replays a scripted sequence of outcomes per task (success once the
///   script runs out)
/// - optionally sleeps per attempt, honouring cancellation
/// - records every attempt and the peak number of concurrent attempts.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    attempts: Mutex<Vec<RecordedAttempt>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for successive attempts of `task`.
    pub fn script(self, task: &str, outcomes: Vec<AttemptOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task.to_string(), outcomes.into());
        self
    }

    /// Fail every one of the first `n` attempts of `task`.
    pub fn failing(self, task: &str, n: usize) -> Self {
        self.script(task, (0..n).map(|_| failed(1)).collect())
    }

    pub fn delay(mut self, task: &str, delay: Duration) -> Self {
        self.delays.insert(task.to_string(), delay);
        self
    }

    pub fn default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn attempts(&self) -> Vec<RecordedAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempts_of(&self, task: &str) -> Vec<RecordedAttempt> {
        self.attempts()
            .into_iter()
            .filter(|a| a.task == task)
            .collect()
    }

    /// Task names in the order their attempts started.
    pub fn started_order(&self) -> Vec<String> {
        let mut attempts = self.attempts();
        attempts.sort_by_key(|a| a.started);
        attempts.into_iter().map(|a| a.task).collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, task: &str) -> AttemptOutcome {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(|q| q.pop_front())
            .unwrap_or(AttemptOutcome::Succeeded {
                exit_code: 0,
                duration: Duration::ZERO,
            })
    }

    async fn run(&self, attempt: TaskAttempt, cancel: CancelToken) -> AttemptReport {
        let name = attempt.task.name.clone();
        let started = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(&name)
            .copied()
            .unwrap_or(self.default_delay);
        let outcome = tokio::select! {
            _ = tokio::time::sleep(delay) => self.next_outcome(&name),
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(RecordedAttempt {
            task: name,
            attempt: attempt.attempt,
            started,
            finished: Instant::now(),
        });
        AttemptReport::from(outcome)
    }
}

impl TaskExecutor for ScriptedExecutor {
    fn run_attempt(
        &self,
        attempt: TaskAttempt,
        cancel: CancelToken,
    ) -> Pin<Box<dyn Future<Output = AttemptReport> + Send + '_>> {
        Box::pin(self.run(attempt, cancel))
    }
}

/// A non-zero exit.
pub fn failed(exit_code: i32) -> AttemptOutcome {
    AttemptOutcome::Failed {
        exit_code: Some(exit_code),
        reason: format!("exited with code {exit_code}"),
        duration: Duration::ZERO,
    }
}
