// src/dag/mod.rs

//! Workflow DAGs and their execution.
//!
//! - [`workflow`] defines tasks and workflows as consumed by the engine.
//! - [`graph`] validates dependencies and plans execution layers.
//! - [`task_state`] is the per-task lifecycle within one run.
//! - [`retry`] computes backoff delays between attempts.
//! - [`run_state`] tracks task records and skip propagation for a run.
//! - [`execution`] holds execution records and status aggregation.
//! - [`history`] is the bounded, persisted list of past executions.
//! - [`engine`] drives a run: layers, concurrency, retries, SLA.

pub mod engine;
pub mod execution;
pub mod graph;
pub mod history;
pub mod retry;
pub mod run_state;
pub mod task_state;
pub mod workflow;

pub use engine::{DagEngine, DryRunReport, EngineSettings, RunOptions, RunOutcome};
pub use execution::{Execution, ExecutionStatus, FailureEvent, TaskRecord, aggregate_status};
pub use graph::{DagGraph, plan, validate};
pub use history::{ExecutionHistory, load_history, record_execution};
pub use retry::BackoffPolicy;
pub use task_state::{TaskEvent, TaskState};
pub use workflow::{Task, Workflow};
