// src/scheduler/mod.rs

//! Time-based triggering of workflows.
//!
//! - [`cron`] parses and evaluates cron expressions.
//! - [`registry`] persists scheduled jobs in the state store.
//! - [`daemon`] ticks the registry and sends run requests to the engine.
//! - [`backfill`] enqueues runs for past occurrences.

pub mod backfill;
pub mod cron;
pub mod daemon;
pub mod registry;

pub use cron::CronSchedule;
pub use daemon::{Scheduler, SchedulerDaemon};
pub use registry::{ClaimedSpan, ClaimedTimes, JobRegistry, ScheduledJob, SchedulerRegistry};
