// src/engine/queue.rs

use std::collections::VecDeque;

use tracing::debug;

use crate::engine::RunRequest;
use crate::types::{RunTrigger, TriggerWhileRunningBehaviour};

/// Requests for one workflow that arrived while it was already running.
///
/// Semantics:
/// - `Queue`: keep up to `max_runs` requests in arrival order; when full,
///   the oldest is dropped and handed back to the caller.
/// - `Cancel`: keep only the latest request. Cancelling the active run is
///   done by the core; the queue only decides what runs afterwards.
/// - Backfill requests bypass both rules: they are kept in logical-time
///   order, never dropped, and a logical time is only kept once.
///
/// [`pop_next`](Self::pop_next) yields the request with the earliest
/// logical time; requests without one (manual) go after timed ones.
#[derive(Debug)]
pub struct RunQueue {
    behaviour: TriggerWhileRunningBehaviour,
    max_runs: usize,
    pending: VecDeque<RunRequest>,
    backfills: VecDeque<RunRequest>,
}

impl RunQueue {
    /// `max_runs` is clamped to at least 1.
    pub fn new(behaviour: TriggerWhileRunningBehaviour, max_runs: usize) -> Self {
        Self {
            behaviour,
            max_runs: max_runs.max(1),
            pending: VecDeque::new(),
            backfills: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.backfills.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.backfills.len()
    }

    pub fn behaviour(&self) -> TriggerWhileRunningBehaviour {
        self.behaviour
    }

    /// Remember a request for after the current run.
    ///
    /// Returns the requests pushed out to make room, which will never run.
    pub fn record(&mut self, request: RunRequest) -> Vec<RunRequest> {
        if request.trigger == RunTrigger::Backfill {
            if self
                .backfills
                .iter()
                .any(|r| r.logical_time == request.logical_time)
            {
                debug!(workflow = %request.workflow, "backfill already queued");
                return Vec::new();
            }
            let at = self
                .backfills
                .iter()
                .position(|r| r.logical_time > request.logical_time)
                .unwrap_or(self.backfills.len());
            self.backfills.insert(at, request);
            return Vec::new();
        }

        match self.behaviour {
            TriggerWhileRunningBehaviour::Queue => {
                if request.logical_time.is_some() && self.pending.contains(&request) {
                    debug!(workflow = %request.workflow, "duplicate request ignored");
                    return Vec::new();
                }
                self.pending.push_back(request);
                let overflow = self.pending.len().saturating_sub(self.max_runs);
                self.pending.drain(..overflow).collect()
            }
            TriggerWhileRunningBehaviour::Cancel => {
                debug!(workflow = %request.workflow, "keeping only the latest request (cancel mode)");
                let replaced = self.pending.drain(..).collect();
                self.pending.push_back(request);
                replaced
            }
        }
    }

    /// Next request to run, earliest logical time first.
    pub fn pop_next(&mut self) -> Option<RunRequest> {
        let take_backfill = match (self.backfills.front(), self.pending.front()) {
            (Some(_), None) => true,
            (None, _) => false,
            (Some(b), Some(p)) => match (b.logical_time, p.logical_time) {
                (Some(bt), Some(pt)) => bt <= pt,
                (_, None) => true,
                (None, Some(_)) => false,
            },
        };
        if take_backfill {
            self.backfills.pop_front()
        } else {
            self.pending.pop_front()
        }
    }

    /// Forget everything that was queued, returning it.
    pub fn clear(&mut self) -> Vec<RunRequest> {
        let mut dropped: Vec<RunRequest> = self.backfills.drain(..).collect();
        dropped.extend(self.pending.drain(..));
        dropped
    }
}
