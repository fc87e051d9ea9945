// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::container::{PortRequest, ResourceLimits, VolumeBinding};
use crate::dag::retry::BackoffPolicy;
use crate::dag::workflow::Workflow;
use crate::types::{BackoffKind, IsolationMode, RestartPolicy, TriggerWhileRunningBehaviour};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [config]
/// parallelism = 4
/// history_limit = 50
///
/// [service.db]
/// image = "postgres:16"
/// command = ["./run"]
/// ports = ["5432"]
/// memory_limit = "256m"
///
/// [workflow.etl]
/// schedule = "0 2 * * *"
///
/// [[workflow.etl.task]]
/// name = "extract"
/// image = "etl:latest"
/// command = "python extract.py"
///
/// [[workflow.etl.task]]
/// name = "transform"
/// image = "etl:latest"
/// command = ["python", "transform.py"]
/// depends_on = ["extract"]
/// retries = 2
/// retry_delay = "30s"
/// ```
///
/// This raw form only captures syntax; [`ConfigFile`] is the validated view.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    /// Long-running services from `[service.<name>]`.
    #[serde(default)]
    pub service: BTreeMap<String, RawServiceConfig>,

    /// Workflows from `[workflow.<name>]`.
    #[serde(default)]
    pub workflow: BTreeMap<String, RawWorkflowConfig>,
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSection {
    /// Where records, images, logs and locks live. Relative paths are
    /// resolved against the config file's directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Concurrent task attempts per run. Defaults to the CPU count.
    #[serde(default)]
    pub parallelism: Option<usize>,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    #[serde(default)]
    pub backoff: BackoffKind,

    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: String,

    /// Inclusive range used for auto-assigned host ports.
    #[serde(default = "default_port_range")]
    pub port_range: [u16; 2],

    #[serde(default = "default_port_attempts")]
    pub port_attempts: u32,

    #[serde(default)]
    pub triggered_while_running_behaviour: TriggerWhileRunningBehaviour,

    /// Maximum number of queued runs per workflow.
    #[serde(default = "default_queue_length")]
    pub queue_length: usize,

    #[serde(default = "default_image_retention")]
    pub image_retention: String,

    #[serde(default = "default_keep_last_images")]
    pub keep_last_images: usize,

    #[serde(default = "default_log_retention")]
    pub log_retention: String,

    /// Largest number of occurrences a single backfill may enqueue.
    #[serde(default = "default_max_backfill_runs")]
    pub max_backfill_runs: usize,

    #[serde(default)]
    pub isolation: IsolationMode,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".stevedore")
}

fn default_history_limit() -> usize {
    100
}

fn default_tick_interval() -> String {
    "1s".to_string()
}

fn default_max_retry_delay() -> String {
    "10m".to_string()
}

fn default_port_range() -> [u16; 2] {
    [49152, 65535]
}

fn default_port_attempts() -> u32 {
    32
}

fn default_queue_length() -> usize {
    1
}

fn default_image_retention() -> String {
    "30d".to_string()
}

fn default_keep_last_images() -> usize {
    3
}

fn default_log_retention() -> String {
    "14d".to_string()
}

fn default_max_backfill_runs() -> usize {
    1000
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            parallelism: None,
            history_limit: default_history_limit(),
            tick_interval: default_tick_interval(),
            backoff: BackoffKind::default(),
            max_retry_delay: default_max_retry_delay(),
            port_range: default_port_range(),
            port_attempts: default_port_attempts(),
            triggered_while_running_behaviour: TriggerWhileRunningBehaviour::default(),
            queue_length: default_queue_length(),
            image_retention: default_image_retention(),
            keep_last_images: default_keep_last_images(),
            log_retention: default_log_retention(),
            max_backfill_runs: default_max_backfill_runs(),
            isolation: IsolationMode::default(),
        }
    }
}

/// A command given either as a shell string (run via `sh -c`) or as an
/// explicit argv list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn into_argv(self) -> Vec<String> {
        match self {
            CommandSpec::Shell(cmd) => vec!["sh".to_string(), "-c".to_string(), cmd],
            CommandSpec::Argv(argv) => argv,
        }
    }
}

/// `[service.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawServiceConfig {
    pub image: String,
    #[serde(default)]
    pub command: Option<CommandSpec>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<u32>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

/// `[workflow.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawWorkflowConfig {
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tasks in declaration order.
    #[serde(default)]
    pub task: Vec<RawTaskConfig>,
}

fn default_enabled() -> bool {
    true
}

/// One `[[workflow.<name>.task]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTaskConfig {
    pub name: String,
    pub image: String,
    pub command: CommandSpec,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay: Option<String>,
    #[serde(default)]
    pub sla: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<u32>,
}

/// Validated global settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub parallelism: usize,
    pub history_limit: usize,
    pub tick_interval: Duration,
    pub backoff: BackoffPolicy,
    pub port_range: (u16, u16),
    pub port_attempts: u32,
    pub triggered_while_running_behaviour: TriggerWhileRunningBehaviour,
    pub queue_length: usize,
    pub image_retention: Duration,
    pub keep_last_images: usize,
    pub log_retention: Duration,
    pub max_backfill_runs: usize,
    pub isolation: IsolationMode,
}

/// Validated long-running service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub ports: Vec<PortRequest>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeBinding>,
    pub limits: ResourceLimits,
    pub restart_policy: RestartPolicy,
}

/// Command used for services that do not declare one: the image's `run`
/// script.
pub const DEFAULT_SERVICE_COMMAND: &str = "./run";

/// Validated configuration. Build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub settings: Settings,
    pub services: BTreeMap<String, ServiceSpec>,
    pub workflows: BTreeMap<String, Workflow>,
}

impl ConfigFile {
    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }
}
