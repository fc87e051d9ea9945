// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`backend`] defines the `TaskExecutor` seam the DAG engine drives, and
//!   the attempt/outcome types that cross it.
//! - [`task_runner`] is the production executor: one container per attempt.

pub mod backend;
pub mod task_runner;

pub use backend::{AttemptOutcome, AttemptReport, TaskAttempt, TaskExecutor};
pub use task_runner::ContainerTaskExecutor;
