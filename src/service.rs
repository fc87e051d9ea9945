// src/service.rs

//! Long-running service containers declared under `[service.<name>]`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::ServiceSpec;
use crate::container::{Container, ContainerRuntime, ContainerSpec, ContainerStatus, LABEL_SERVICE};
use crate::errors::{Result, StevedoreError};
use crate::types::RestartPolicy;

/// Current container of a configured service.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub container: Option<Container>,
}

/// Starts, stops and supervises service containers.
#[derive(Debug)]
pub struct ServiceManager {
    runtime: ContainerRuntime,
    services: BTreeMap<String, ServiceSpec>,
}

impl ServiceManager {
    pub fn new(runtime: ContainerRuntime, services: BTreeMap<String, ServiceSpec>) -> Self {
        Self { runtime, services }
    }

    fn spec(&self, name: &str) -> Result<&ServiceSpec> {
        self.services
            .get(name)
            .ok_or_else(|| StevedoreError::ConfigError(format!("unknown service '{name}'")))
    }

    /// Containers labelled as belonging to `name`, oldest first.
    fn containers_of(&self, name: &str) -> Result<Vec<Container>> {
        Ok(self
            .runtime
            .list()?
            .into_iter()
            .filter(|c| c.labels.get(LABEL_SERVICE).map(String::as_str) == Some(name))
            .collect())
    }

    /// Create and start the service's container. A service that is already
    /// running is left alone.
    pub async fn up(&self, name: &str) -> Result<Container> {
        let spec = self.spec(name)?;
        if let Some(running) = self
            .containers_of(name)?
            .into_iter()
            .find(|c| c.status == ContainerStatus::Running)
        {
            info!(service = name, container = %running.id, "service already running");
            return Ok(running);
        }

        let container_spec = ContainerSpec {
            image: spec.image.clone(),
            command: spec.command.clone(),
            env: spec.env.clone(),
            limits: spec.limits,
            ports: spec.ports.clone(),
            volumes: spec.volumes.clone(),
            labels: BTreeMap::from([(LABEL_SERVICE.to_string(), name.to_string())]),
            log_path: None,
        };
        let created = self.runtime.create(container_spec).await?;
        let started = self.runtime.start(&created.id).await?;
        info!(service = name, container = %started.id, ports = ?started.ports, "service up");
        Ok(started)
    }

    /// Delete every container of the service. Returns how many were removed.
    pub async fn down(&self, name: &str) -> Result<usize> {
        self.spec(name)?;
        let mut removed = 0;
        for c in self.containers_of(name)? {
            if self.runtime.delete(&c.id).await?.is_some() {
                removed += 1;
            }
        }
        info!(service = name, removed, "service down");
        Ok(removed)
    }

    pub fn status(&self) -> Result<Vec<ServiceStatus>> {
        let mut out = Vec::with_capacity(self.services.len());
        for name in self.services.keys() {
            out.push(ServiceStatus {
                name: name.clone(),
                container: self.containers_of(name)?.pop(),
            });
        }
        Ok(out)
    }

    /// Apply restart policies once. Services that were never brought up are
    /// not started. Returns the names of restarted services.
    pub async fn supervise_once(&self) -> Result<Vec<String>> {
        let mut restarted = Vec::new();
        for (name, spec) in &self.services {
            let Some(latest) = self.containers_of(name)?.pop() else {
                continue;
            };
            if !latest.status.is_terminal() || !should_restart(spec.restart_policy, latest.status) {
                continue;
            }

            warn!(
                service = %name,
                container = %latest.id,
                status = %latest.status,
                exit_code = ?latest.exit_code,
                "service exited; restarting"
            );
            self.runtime.delete(&latest.id).await?;
            self.up(name).await?;
            restarted.push(name.clone());
        }
        Ok(restarted)
    }

    /// Run [`supervise_once`](Self::supervise_once) every `interval` until
    /// `shutdown` fires.
    pub fn supervise(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancelToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.supervise_once().await {
                            warn!(error = %e, "service supervision failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

pub(crate) fn should_restart(policy: RestartPolicy, status: ContainerStatus) -> bool {
    match policy {
        RestartPolicy::Always => true,
        RestartPolicy::OnFailure => {
            matches!(status, ContainerStatus::Failed | ContainerStatus::Killed)
        }
        RestartPolicy::Never => false,
    }
}
