// src/container/mod.rs

//! Single-host container runtime.
//!
//! - [`runtime`] owns container lifecycles (create/start/wait/kill/delete).
//! - [`isolation`] abstracts the kernel facilities used to sandbox a process.
//! - [`network`] hands out host ports.
//! - [`volume`] attaches host directories into a container root.
//! - [`rootfs`] materialises a private root from an extracted image.
//! - [`stats`] samples process resource usage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod isolation;
pub mod network;
pub mod rootfs;
pub mod runtime;
pub mod stats;
pub mod volume;

pub use isolation::{CgroupIsolation, HostIsolation, IsolationBackend, IsolationContext, detect_backend};
pub use network::PortAllocator;
pub use runtime::{ContainerRuntime, RuntimeSettings};

/// Label keys attached by the DAG engine.
pub const LABEL_WORKFLOW: &str = "stevedore.workflow";
pub const LABEL_TASK: &str = "stevedore.task";
pub const LABEL_EXECUTION: &str = "stevedore.execution";
pub const LABEL_SERVICE: &str = "stevedore.service";

/// Lifecycle state of a container.
///
/// `Created -> Running -> {Succeeded, Failed, Killed}`, `Created -> Failed`
/// on launch failure, and any state may move to `Deleted`. Nothing leaves
/// `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Succeeded,
    Failed,
    Killed,
    Deleted,
}

impl ContainerStatus {
    /// The process has exited (or never will).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContainerStatus::Succeeded | ContainerStatus::Failed | ContainerStatus::Killed
        )
    }

    pub fn can_transition_to(self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Created, Running) | (Created, Failed) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Killed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Succeeded => "succeeded",
            ContainerStatus::Failed => "failed",
            ContainerStatus::Killed => "killed",
            ContainerStatus::Deleted => "deleted",
        };
        f.pad(s)
    }
}

/// Requested resource ceilings. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    /// Percent of one CPU, 1-100.
    pub cpu_percent: Option<u32>,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        self.memory_bytes.is_none() && self.cpu_percent.is_none()
    }
}

/// A port the container wants exposed. `host_port = None` means "any free
/// port from the configured range".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// One resource usage sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub rss_bytes: u64,
    pub cpu_percent: f32,
    pub uptime: Duration,
    pub sampled_at: DateTime<Utc>,
}

/// Result of waiting for a container to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Image reference, `name[:tag]`.
    pub image: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub ports: Vec<PortRequest>,
    pub volumes: Vec<VolumeBinding>,
    pub labels: BTreeMap<String, String>,
    /// Where stdout/stderr go. Defaults to `logs/containers/<id>.log`.
    pub log_path: Option<PathBuf>,
}

/// Persisted container record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub image: String,
    pub image_digest: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: ContainerStatus,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    /// Degraded enforcement notes (limits or mounts the host could not honour).
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub samples: Vec<Stats>,
    pub rootfs: PathBuf,
    pub log_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Container {
    /// Wall-clock run time, if the container has started.
    pub fn run_duration(&self) -> Duration {
        match self.started_at {
            Some(start) => {
                let end = self.finished_at.unwrap_or_else(Utc::now);
                (end - start).to_std().unwrap_or_default()
            }
            None => Duration::ZERO,
        }
    }

    pub fn exit_result(&self) -> ExitResult {
        ExitResult {
            status: self.status,
            exit_code: self.exit_code,
            duration: self.run_duration(),
        }
    }
}
