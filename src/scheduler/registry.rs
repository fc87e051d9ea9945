// src/scheduler/registry.rs

//! Persisted set of scheduled jobs (`scheduler.json`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{Result, StevedoreError};
use crate::scheduler::cron::CronSchedule;
use crate::store::{RecordKind, StateStore};
use crate::types::WorkflowName;

const REGISTRY_KEY: &str = "registry";

/// Cron trigger for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub workflow: WorkflowName,
    pub cron: String,
    pub enabled: bool,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub last_fired_time: Option<DateTime<Utc>>,
    /// Logical times already enqueued, by the tick or by backfill.
    #[serde(default)]
    pub claimed: ClaimedTimes,
}

impl ScheduledJob {
    pub fn schedule(&self) -> Result<CronSchedule> {
        self.cron.parse()
    }

    /// Enabled and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_time.is_some_and(|t| t <= now)
    }
}

/// Inclusive span of consecutive occurrences, all claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedSpan {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

/// Claimed logical times of one job, kept as sorted disjoint spans.
///
/// Neighbouring occurrences collapse into one span, so the record grows
/// with the number of gaps in a job's history rather than with the number
/// of runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimedTimes {
    spans: Vec<ClaimedSpan>,
}

impl ClaimedTimes {
    pub fn spans(&self) -> &[ClaimedSpan] {
        &self.spans
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        let idx = self.spans.partition_point(|s| s.last < t);
        self.spans.get(idx).is_some_and(|s| s.first <= t)
    }

    /// Claim occurrence `t` of `schedule`. Returns false if it was already
    /// claimed.
    pub fn insert(&mut self, t: DateTime<Utc>, schedule: &CronSchedule) -> bool {
        if self.contains(t) {
            return false;
        }
        let mut idx = self.spans.partition_point(|s| s.last < t);
        self.spans.insert(idx, ClaimedSpan { first: t, last: t });

        if idx > 0 && schedule.next_after(self.spans[idx - 1].last) == Some(t) {
            self.spans[idx - 1].last = t;
            self.spans.remove(idx);
            idx -= 1;
        }
        let joins_next = self
            .spans
            .get(idx + 1)
            .is_some_and(|next| schedule.next_after(t) == Some(next.first));
        if joins_next {
            self.spans[idx].last = self.spans[idx + 1].last;
            self.spans.remove(idx + 1);
        }
        true
    }
}

/// Contents of `scheduler.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerRegistry {
    pub jobs: BTreeMap<WorkflowName, ScheduledJob>,
}

/// A due job claimed by a tick: persisted as fired, not yet enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedFire {
    pub workflow: WorkflowName,
    pub logical_time: DateTime<Utc>,
}

/// Read/modify access to the registry, always under its record lock.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    store: StateStore,
}

impl JobRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Load the registry, repairing jobs left inconsistent by a crash
    /// between recording a fire and advancing `next_fire_time`.
    pub fn load(&self) -> Result<SchedulerRegistry> {
        let mut repaired = false;
        let registry = self.update(|reg| {
            for job in reg.jobs.values_mut() {
                if let (Some(last), Some(next)) = (job.last_fired_time, job.next_fire_time) {
                    if last >= next {
                        let schedule = match job.schedule() {
                            Ok(schedule) => schedule,
                            Err(e) => {
                                warn!(workflow = %job.workflow, error = %e, "cannot repair job with invalid cron");
                                continue;
                            }
                        };
                        job.next_fire_time = schedule.next_after(last);
                        warn!(
                            workflow = %job.workflow,
                            last_fired = %last,
                            next_fire = ?job.next_fire_time,
                            "repaired scheduler job after unclean shutdown"
                        );
                        repaired = true;
                    }
                }
            }
            Ok(())
        })?;
        if repaired {
            info!("scheduler registry repaired");
        }
        Ok(registry)
    }

    pub fn jobs(&self) -> Result<Vec<ScheduledJob>> {
        let reg: SchedulerRegistry = self
            .store
            .read_record(RecordKind::Scheduler, REGISTRY_KEY)?
            .unwrap_or_default();
        Ok(reg.jobs.into_values().collect())
    }

    pub fn job(&self, workflow: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs()?.into_iter().find(|j| j.workflow == workflow))
    }

    /// Register (or re-register) a cron trigger. Re-registering with the same
    /// expression keeps the job's history and enabled flag.
    pub fn schedule(&self, workflow: &str, cron: &str, now: DateTime<Utc>) -> Result<ScheduledJob> {
        let schedule: CronSchedule = cron.parse()?;
        let next = schedule.next_after(now);
        let mut result = None;

        self.update(|reg| {
            let job = reg
                .jobs
                .entry(workflow.to_string())
                .and_modify(|job| {
                    if job.cron != schedule.expression() {
                        job.cron = schedule.expression().to_string();
                        job.next_fire_time = next;
                    }
                })
                .or_insert_with(|| ScheduledJob {
                    workflow: workflow.to_string(),
                    cron: schedule.expression().to_string(),
                    enabled: true,
                    next_fire_time: next,
                    last_fired_time: None,
                    claimed: ClaimedTimes::default(),
                });
            result = Some(job.clone());
            Ok(())
        })?;

        let job = result.ok_or_else(|| StevedoreError::WorkflowNotFound(workflow.to_string()))?;
        info!(workflow, cron = %job.cron, next_fire = ?job.next_fire_time, "workflow scheduled");
        Ok(job)
    }

    /// Remove a job. Returns whether it existed.
    pub fn unschedule(&self, workflow: &str) -> Result<bool> {
        let mut existed = false;
        self.update(|reg| {
            existed = reg.jobs.remove(workflow).is_some();
            Ok(())
        })?;
        if existed {
            info!(workflow, "workflow unscheduled");
        }
        Ok(existed)
    }

    /// Stop firing without touching `next_fire_time`.
    pub fn pause(&self, workflow: &str) -> Result<ScheduledJob> {
        self.set_enabled(workflow, false)
    }

    /// Resume firing; `next_fire_time` is left as it was.
    pub fn resume(&self, workflow: &str) -> Result<ScheduledJob> {
        self.set_enabled(workflow, true)
    }

    fn set_enabled(&self, workflow: &str, enabled: bool) -> Result<ScheduledJob> {
        let mut result = None;
        self.update(|reg| {
            let job = reg
                .jobs
                .get_mut(workflow)
                .ok_or_else(|| StevedoreError::WorkflowNotFound(workflow.to_string()))?;
            job.enabled = enabled;
            result = Some(job.clone());
            Ok(())
        })?;
        info!(workflow, enabled, "scheduler job toggled");
        result.ok_or_else(|| StevedoreError::WorkflowNotFound(workflow.to_string()))
    }

    /// Record every due job as fired and advance it, in one locked write.
    ///
    /// A job more than one occurrence behind fires only its latest missed
    /// occurrence. A job whose stored cron no longer parses is skipped.
    /// Returns the claimed fires; nothing is returned if the write fails.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<ClaimedFire>> {
        let mut fires = Vec::new();
        self.update(|reg| {
            for job in reg.jobs.values_mut() {
                if !job.is_due(now) {
                    continue;
                }
                let Some(due) = job.next_fire_time else {
                    continue;
                };
                let schedule = match job.schedule() {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        warn!(workflow = %job.workflow, cron = %job.cron, error = %e, "skipping job with invalid cron");
                        continue;
                    }
                };
                let fire_time = schedule.latest_at_or_before(due, now);
                job.last_fired_time = Some(fire_time);
                job.next_fire_time = schedule.next_after(fire_time);
                job.claimed.insert(fire_time, &schedule);
                fires.push(ClaimedFire {
                    workflow: job.workflow.clone(),
                    logical_time: fire_time,
                });
            }
            Ok(())
        })
        .map_err(persistence_error)?;
        Ok(fires)
    }

    /// Claim every occurrence in `[start, end]` not claimed before, in one
    /// locked write. Returns the fresh logical times, oldest first.
    ///
    /// A window with more than `max_runs` occurrences is rejected and
    /// nothing is claimed.
    pub fn claim_backfill(
        &self,
        workflow: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_runs: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut fresh = Vec::new();
        self.update(|reg| {
            let job = reg
                .jobs
                .get_mut(workflow)
                .ok_or_else(|| StevedoreError::WorkflowNotFound(workflow.to_string()))?;
            let schedule = job.schedule()?;
            let occurrences = schedule.occurrences_within(start, end, max_runs).ok_or_else(|| {
                StevedoreError::ConfigError(format!(
                    "backfill window {start}..{end} has more than {max_runs} occurrences"
                ))
            })?;
            debug!(workflow, candidates = occurrences.len(), "backfill window enumerated");
            for logical_time in occurrences {
                if job.claimed.insert(logical_time, &schedule) {
                    fresh.push(logical_time);
                } else {
                    debug!(workflow, %logical_time, "occurrence already claimed; skipping");
                }
            }
            Ok(())
        })
        .map_err(|e| match e {
            StevedoreError::WorkflowNotFound(_) | StevedoreError::ConfigError(_) => e,
            other => persistence_error(other),
        })?;
        Ok(fresh)
    }

    fn update<F>(&self, f: F) -> Result<SchedulerRegistry>
    where
        F: FnOnce(&mut SchedulerRegistry) -> Result<()>,
    {
        self.store
            .update_record(RecordKind::Scheduler, REGISTRY_KEY, |current: Option<SchedulerRegistry>| {
                let mut reg = current.unwrap_or_default();
                f(&mut reg)?;
                Ok(reg)
            })
    }
}

fn persistence_error(err: StevedoreError) -> StevedoreError {
    match err {
        StevedoreError::SchedulerPersistenceError(_) => err,
        StevedoreError::InvalidCron { .. } => err,
        other => StevedoreError::SchedulerPersistenceError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn neighbouring_claims_collapse_into_one_span() {
        let hourly: CronSchedule = "0 * * * *".parse().unwrap();
        let mut claimed = ClaimedTimes::default();

        assert!(claimed.insert(at(1), &hourly));
        assert!(claimed.insert(at(5), &hourly));
        assert_eq!(claimed.spans().len(), 2);
        assert!(!claimed.contains(at(3)));

        for h in [3, 2, 4] {
            assert!(claimed.insert(at(h), &hourly));
        }
        assert_eq!(claimed.spans(), &[ClaimedSpan { first: at(1), last: at(5) }]);
        assert!(claimed.contains(at(3)));
        assert!(!claimed.insert(at(4), &hourly));
        assert!(!claimed.contains(at(0)));
        assert!(!claimed.contains(at(6)));
    }
}
