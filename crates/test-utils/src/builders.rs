#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use stevedore::config::{
    CommandSpec, ConfigFile, ConfigSection, RawConfigFile, RawTaskConfig, RawWorkflowConfig,
};
use stevedore::dag::{Task, Workflow};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                service: BTreeMap::new(),
                workflow: BTreeMap::new(),
            },
        }
    }

    pub fn with_workflow(mut self, name: &str, workflow: RawWorkflowConfig) -> Self {
        self.config.workflow.insert(name.to_string(), workflow);
        self
    }

    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        self.config.config.state_dir = dir.to_path_buf();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.config.config.parallelism = Some(parallelism);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `RawWorkflowConfig`.
pub struct WorkflowConfigBuilder {
    workflow: RawWorkflowConfig,
}

impl WorkflowConfigBuilder {
    pub fn new() -> Self {
        Self {
            workflow: RawWorkflowConfig {
                schedule: None,
                description: None,
                enabled: true,
                task: Vec::new(),
            },
        }
    }

    pub fn schedule(mut self, cron: &str) -> Self {
        self.workflow.schedule = Some(cron.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.workflow.enabled = false;
        self
    }

    pub fn with_task(mut self, task: RawTaskConfig) -> Self {
        self.workflow.task.push(task);
        self
    }

    pub fn build(self) -> RawWorkflowConfig {
        self.workflow
    }
}

impl Default for WorkflowConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `RawTaskConfig`.
pub struct TaskConfigBuilder {
    task: RawTaskConfig,
}

impl TaskConfigBuilder {
    pub fn new(name: &str, cmd: &str) -> Self {
        Self {
            task: RawTaskConfig {
                name: name.to_string(),
                image: "busybox:latest".to_string(),
                command: CommandSpec::Shell(cmd.to_string()),
                depends_on: vec![],
                timeout: None,
                retries: 0,
                retry_delay: None,
                sla: None,
                on_failure: None,
                env: BTreeMap::new(),
                memory_limit: None,
                cpu_limit: None,
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.depends_on.push(dep.to_string());
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.task.image = image.to_string();
        self
    }

    pub fn retries(mut self, retries: u32, delay: &str) -> Self {
        self.task.retries = retries;
        self.task.retry_delay = Some(delay.to_string());
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.task.timeout = Some(timeout.to_string());
        self
    }

    pub fn build(self) -> RawTaskConfig {
        self.task
    }
}

/// Builder for an engine-ready `Workflow`, bypassing the config layer.
pub struct WorkflowBuilder {
    name: String,
    tasks: Vec<Task>,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tasks: Vec::new(),
        }
    }

    /// Add a task running `sh -c "true"` that depends on `deps`.
    pub fn task(self, name: &str, deps: &[&str]) -> Self {
        self.with(TaskBuilder::new(name).after(deps).build())
    }

    pub fn with(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn build(self) -> Workflow {
        Workflow::new(self.name, self.tasks)
    }
}

/// Builder for a single engine `Task`.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            task: Task::new(name, "busybox:latest", ["sh", "-c", "true"]),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.task
            .depends_on
            .extend(deps.iter().map(|d| d.to_string()));
        self
    }

    pub fn command(mut self, argv: &[&str]) -> Self {
        self.task.command = argv.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn image(mut self, image: &str) -> Self {
        self.task.image = image.to_string();
        self
    }

    pub fn retries(mut self, retries: u32, delay: Duration) -> Self {
        self.task.retries = retries;
        self.task.retry_delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.timeout = Some(timeout);
        self
    }

    pub fn sla(mut self, sla: Duration) -> Self {
        self.task.sla = Some(sla);
        self
    }

    pub fn on_failure(mut self, hook: &str) -> Self {
        self.task.on_failure = Some(hook.to_string());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}
