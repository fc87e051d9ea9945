// src/scheduler/backfill.rs

//! Retroactive runs for cron occurrences missed while nothing was ticking.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::engine::RunRequest;
use crate::errors::{Result, StevedoreError};
use crate::scheduler::daemon::Scheduler;

impl Scheduler {
    /// Enqueue one run per occurrence of the workflow's cron expression in
    /// `[start, end]`, oldest first.
    ///
    /// Occurrences already fired by the tick or enqueued by an earlier
    /// backfill are skipped, so re-running after a partial failure never
    /// duplicates work. The whole window is claimed in a single registry
    /// write before anything is sent. Returns the logical times enqueued by
    /// this call.
    pub async fn backfill(
        &self,
        workflow: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        if start > end {
            return Err(StevedoreError::ConfigError(format!(
                "backfill start {start} is after end {end}"
            )));
        }

        let fresh = self
            .registry
            .claim_backfill(workflow, start, end, self.max_backfill_runs)?;
        for logical_time in &fresh {
            self.enqueue(RunRequest::backfill(workflow, *logical_time))
                .await?;
        }

        info!(workflow, enqueued = fresh.len(), "backfill complete");
        Ok(fresh)
    }
}
