// src/dag/workflow.rs

//! Workflow and task definitions as consumed by the engine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::ResourceLimits;
use crate::types::{TaskName, WorkflowName};

/// Default delay before retrying a failed attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(300);

/// One node of a workflow: a container invocation with a failure policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: TaskName,
    /// Image reference, `name[:tag]`.
    pub image: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskName>,
    #[serde(default)]
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub sla: Option<Duration>,
    /// Notification hook to fire once retries are exhausted.
    pub on_failure: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        command: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: command.into_iter().map(Into::into).collect(),
            depends_on: Vec::new(),
            retries: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: None,
            sla: None,
            on_failure: None,
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
        }
    }

    /// Upper bound on attempts: the first run plus every retry.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// A named DAG of tasks. Task order is declaration order and is used to
/// break ties when planning layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: WorkflowName,
    pub tasks: Vec<Task>,
    pub schedule: Option<String>,
    pub description: Option<String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl Workflow {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            tasks,
            schedule: None,
            description: None,
            enabled: true,
        }
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }
}
