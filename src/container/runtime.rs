// src/container/runtime.rs

//! Container lifecycle management.
//!
//! Records live in the state store and are the source of truth for status;
//! this module additionally keeps per-process handles (isolation context,
//! attached volumes, kill switch, exit channel) for containers started by
//! the current process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::isolation::{IsolationBackend, IsolationContext};
use crate::container::network::PortAllocator;
use crate::container::stats::StatsSampler;
use crate::container::volume::{self, AttachedVolume};
use crate::container::{
    Container, ContainerSpec, ContainerStatus, ExitResult, PortMapping, Stats, rootfs,
};
use crate::errors::{Result, StevedoreError};
use crate::image::ImageStore;
use crate::store::{RecordKind, StateStore};

/// Upper bound on how long `kill`/`delete` wait for the process to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(10);

/// Runtime-wide knobs taken from `[config]`.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub port_range: (u16, u16),
    pub port_attempts: u32,
    /// Samples kept per container by `observe`.
    pub max_samples: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            port_range: (49152, 65535),
            port_attempts: 32,
            max_samples: 60,
        }
    }
}

#[derive(Debug)]
struct LiveContainer {
    ctx: IsolationContext,
    volumes: Vec<AttachedVolume>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<watch::Receiver<Option<ExitResult>>>,
}

#[derive(Debug)]
struct Inner {
    store: StateStore,
    images: Arc<ImageStore>,
    isolation: Arc<dyn IsolationBackend>,
    ports: PortAllocator,
    sampler: StatsSampler,
    live: Mutex<HashMap<String, LiveContainer>>,
    max_samples: usize,
}

/// Handle to the container runtime. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    inner: Arc<Inner>,
}

impl ContainerRuntime {
    pub fn new(
        store: StateStore,
        images: Arc<ImageStore>,
        isolation: Arc<dyn IsolationBackend>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                images,
                isolation,
                ports: PortAllocator::new(settings.port_range, settings.port_attempts),
                sampler: StatsSampler::new(),
                live: Mutex::new(HashMap::new()),
                max_samples: settings.max_samples.max(1),
            }),
        }
    }

    pub fn isolation_name(&self) -> &'static str {
        self.inner.isolation.name()
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.inner.images
    }

    /// Reconcile records left behind by a previous process.
    ///
    /// Containers recorded as running have lost their supervisor and are
    /// marked failed; ports of every live record are reserved again.
    /// Returns the number of records repaired.
    pub fn recover(&self) -> Result<usize> {
        let mut repaired = 0;
        for record in self.list()? {
            self.inner.ports.reserve(&record.ports);
            if record.status != ContainerStatus::Running {
                continue;
            }
            self.inner.transition(&record.id, ContainerStatus::Failed, |c| {
                c.finished_at = Some(Utc::now());
                c.warnings
                    .push("runtime restarted while the container was running".to_string());
            })?;
            warn!(container = %record.id, "marking orphaned container as failed");
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Create a container from `spec`. Nothing is left allocated on error.
    pub async fn create(&self, spec: ContainerSpec) -> Result<Container> {
        if spec.command.is_empty() {
            return Err(StevedoreError::ConfigError(
                "container command must not be empty".to_string(),
            ));
        }
        let inner = &self.inner;
        let image = inner.images.get(&spec.image)?;
        let shared_root = inner.images.extract(&image).await?;

        let id = new_container_id();
        let run_dir = inner.store.run_dir().join(&id);
        let private_root = run_dir.join("rootfs");

        let copy_from = shared_root.clone();
        let copy_to = private_root.clone();
        let copied = tokio::task::spawn_blocking(move || rootfs::copy_tree(&copy_from, &copy_to))
            .await
            .map_err(|e| anyhow::anyhow!("rootfs copy task failed: {e}"))
            .and_then(|r| r);
        if let Err(e) = copied {
            let _ = std::fs::remove_dir_all(&run_dir);
            return Err(StevedoreError::ExtractionFailed {
                image: image.reference(),
                reason: format!("{e:#}"),
            });
        }

        let mut warnings = Vec::new();
        let ctx = match inner.isolation.create(&id) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(container = %id, error = %e, "isolation unavailable; running degraded");
                warnings.push(format!("isolation: {e}"));
                IsolationContext {
                    container_id: id.clone(),
                    degraded: true,
                    ..Default::default()
                }
            }
        };

        if let Err(e) = inner.isolation.apply_limits(&ctx, &spec.limits) {
            warn!(container = %id, error = %e, "resource limits not enforced");
            warnings.push(e.to_string());
        }

        let mut attached = Vec::with_capacity(spec.volumes.len());
        for binding in &spec.volumes {
            match volume::attach(&private_root, binding, ctx.privileged) {
                Ok((vol, warning)) => {
                    if let Some(w) = warning {
                        warn!(container = %id, "{w}");
                        warnings.push(w);
                    }
                    attached.push(vol);
                }
                Err(e) => {
                    inner.release(&ctx, &attached, &[], &run_dir);
                    return Err(e.context(format!(
                        "attaching volume {}",
                        binding.container_path.display()
                    ))
                    .into());
                }
            }
        }

        let ports = match inner.ports.allocate(&spec.ports) {
            Ok(ports) => ports,
            Err(e) => {
                inner.release(&ctx, &attached, &[], &run_dir);
                return Err(e);
            }
        };

        let log_path = spec
            .log_path
            .clone()
            .unwrap_or_else(|| inner.store.container_log_path(&id));
        let record = Container {
            id: id.clone(),
            image: image.reference(),
            image_digest: image.digest.clone(),
            command: spec.command,
            env: spec.env,
            limits: spec.limits,
            ports,
            volumes: spec.volumes,
            labels: spec.labels,
            status: ContainerStatus::Created,
            exit_code: None,
            pid: None,
            warnings,
            samples: Vec::new(),
            rootfs: private_root,
            log_path,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        if let Err(e) = inner
            .store
            .write_record(RecordKind::Container, &id, &record)
        {
            inner.release(&ctx, &attached, &record.ports, &run_dir);
            return Err(e);
        }

        inner.live_map().insert(
            id.clone(),
            LiveContainer {
                ctx,
                volumes: attached,
                kill_tx: None,
                exit_rx: None,
            },
        );
        info!(container = %id, image = %record.image, "container created");
        Ok(record)
    }

    /// Launch the container's process.
    pub async fn start(&self, id: &str) -> Result<Container> {
        let inner = &self.inner;
        let record = self.get(id)?;
        if record.status != ContainerStatus::Created {
            return Err(StevedoreError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: ContainerStatus::Running.to_string(),
            });
        }

        let ctx = inner
            .live_map()
            .get(id)
            .map(|l| l.ctx.clone())
            .unwrap_or_else(|| inner.isolation.resume(id));

        let mut cmd = match build_command(&record, &ctx, inner.isolation.as_ref()) {
            Ok(cmd) => cmd,
            Err(e) => return Err(inner.launch_failed(id, format!("{e:#}"))),
        };
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Err(inner.launch_failed(id, e.to_string())),
        };

        let pid = child.id();
        let mut attach_warning = None;
        if let Some(pid) = pid {
            if let Err(e) = inner.isolation.attach_process(&ctx, pid) {
                warn!(container = %id, error = %e, "could not move process into isolation context");
                attach_warning = Some(format!("isolation attach: {e}"));
            }
        }

        let started = Instant::now();
        let running = inner.transition(id, ContainerStatus::Running, |c| {
            c.pid = pid;
            c.started_at = Some(Utc::now());
            c.warnings.extend(attach_warning);
        });
        let running = match running {
            Ok(r) => r,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let mut live = inner.live_map();
            let entry = live.entry(id.to_string()).or_insert_with(|| LiveContainer {
                ctx,
                volumes: Vec::new(),
                kill_tx: None,
                exit_rx: None,
            });
            entry.kill_tx = Some(kill_tx);
            entry.exit_rx = Some(exit_rx);
        }

        let waiter = Arc::clone(&self.inner);
        let cid = id.to_string();
        tokio::spawn(async move {
            let (status, code) = tokio::select! {
                res = child.wait() => match res {
                    Ok(s) if s.success() => (ContainerStatus::Succeeded, s.code()),
                    Ok(s) => (ContainerStatus::Failed, s.code()),
                    Err(e) => {
                        warn!(container = %cid, error = %e, "waiting on container process failed");
                        (ContainerStatus::Failed, None)
                    }
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(container = %cid, error = %e, "kill failed");
                    }
                    (ContainerStatus::Killed, None)
                }
            };

            let finished = Utc::now();
            let exit = match waiter.transition(&cid, status, |c| {
                c.exit_code = code;
                c.finished_at = Some(finished);
            }) {
                Ok(record) => record.exit_result(),
                Err(e) => {
                    debug!(container = %cid, error = %e, "exit not recorded");
                    ExitResult {
                        status,
                        exit_code: code,
                        duration: started.elapsed(),
                    }
                }
            };
            info!(container = %cid, status = %exit.status, exit_code = ?exit.exit_code, "container exited");
            let _ = exit_tx.send(Some(exit));
        });

        info!(container = %id, pid = ?pid, "container started");
        Ok(running)
    }

    /// Wait for the container to exit.
    ///
    /// On timeout the process is left running; the caller decides whether
    /// to `kill` it.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<ExitResult> {
        let rx = self
            .inner
            .live_map()
            .get(id)
            .and_then(|l| l.exit_rx.clone());

        let Some(mut rx) = rx else {
            let record = self.get(id)?;
            if record.status.is_terminal() {
                return Ok(record.exit_result());
            }
            return Err(StevedoreError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: "exited".to_string(),
            });
        };

        let exited = async move {
            let value = rx.wait_for(Option::is_some).await.ok().and_then(|v| *v);
            value
        };
        let exit = match timeout {
            Some(duration) => tokio::time::timeout(duration, exited)
                .await
                .map_err(|_| StevedoreError::TimeoutExceeded {
                    id: id.to_string(),
                    duration,
                })?,
            None => exited.await,
        };
        match exit {
            Some(exit) => Ok(exit),
            None => Ok(self.get(id)?.exit_result()),
        }
    }

    /// SIGKILL a running container and wait for it to be reaped.
    pub async fn kill(&self, id: &str) -> Result<ExitResult> {
        let record = self.get(id)?;
        if record.status.is_terminal() {
            return Ok(record.exit_result());
        }
        if record.status != ContainerStatus::Running {
            return Err(StevedoreError::InvalidTransition {
                id: id.to_string(),
                from: record.status.to_string(),
                to: ContainerStatus::Killed.to_string(),
            });
        }

        let (kill_tx, supervised) = {
            let mut live = self.inner.live_map();
            match live.get_mut(id) {
                Some(l) => (l.kill_tx.take(), l.exit_rx.is_some()),
                None => (None, false),
            }
        };
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        if supervised {
            return self.wait(id, Some(KILL_GRACE)).await;
        }

        // Not started by this process: signal the pid directly.
        if let Some(pid) = record.pid {
            signal_kill(pid);
        }
        let killed = self.inner.transition(id, ContainerStatus::Killed, |c| {
            c.finished_at = Some(Utc::now());
        })?;
        info!(container = %id, "container killed");
        Ok(killed.exit_result())
    }

    /// Sample resource usage. Once the process has exited, the last known
    /// sample is returned.
    pub fn observe(&self, id: &str) -> Result<Stats> {
        let record = self.get(id)?;
        let now = Utc::now();

        if record.status == ContainerStatus::Running {
            if let Some((rss_bytes, cpu_percent)) =
                record.pid.and_then(|pid| self.inner.sampler.sample(pid))
            {
                let stats = Stats {
                    rss_bytes,
                    cpu_percent,
                    uptime: record.run_duration(),
                    sampled_at: now,
                };
                let max = self.inner.max_samples;
                self.inner.store.update_record(
                    RecordKind::Container,
                    id,
                    |current: Option<Container>| {
                        let mut c = current
                            .ok_or_else(|| StevedoreError::ContainerNotFound(id.to_string()))?;
                        c.samples.push(stats);
                        if c.samples.len() > max {
                            let excess = c.samples.len() - max;
                            c.samples.drain(..excess);
                        }
                        Ok(c)
                    },
                )?;
                return Ok(stats);
            }
        }

        Ok(record.samples.last().copied().unwrap_or(Stats {
            rss_bytes: 0,
            cpu_percent: 0.0,
            uptime: record.run_duration(),
            sampled_at: now,
        }))
    }

    /// Remove a container and everything allocated for it.
    ///
    /// Returns the final record (status `Deleted`), or `None` if the
    /// container was already gone.
    pub async fn delete(&self, id: &str) -> Result<Option<Container>> {
        let inner = &self.inner;
        let Some(record) = inner
            .store
            .read_record::<Container>(RecordKind::Container, id)?
        else {
            inner.live_map().remove(id);
            return Ok(None);
        };

        if record.status == ContainerStatus::Running {
            match self.kill(id).await {
                Ok(_) => {}
                Err(StevedoreError::TimeoutExceeded { .. }) => {
                    warn!(container = %id, "process did not exit after kill; deleting anyway");
                }
                Err(e) => return Err(e),
            }
        }

        let live = inner.live_map().remove(id);
        let (ctx, volumes) = match live {
            Some(l) => (l.ctx, l.volumes),
            None => (
                inner.isolation.resume(id),
                record
                    .volumes
                    .iter()
                    .map(|b| volume::reattached(&record.rootfs, b))
                    .collect(),
            ),
        };
        let run_dir = inner.store.run_dir().join(id);
        inner.release(&ctx, &volumes, &record.ports, &run_dir);

        let mut deleted = record;
        deleted.status = ContainerStatus::Deleted;
        inner.store.remove_record(RecordKind::Container, id)?;
        info!(container = %id, "container deleted");
        Ok(Some(deleted))
    }

    pub fn get(&self, id: &str) -> Result<Container> {
        self.inner
            .store
            .read_record(RecordKind::Container, id)?
            .ok_or_else(|| StevedoreError::ContainerNotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Container>> {
        let mut containers: Vec<Container> =
            self.inner.store.list_records(RecordKind::Container)?;
        containers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(containers)
    }

    /// Digests of images referenced by existing containers.
    pub fn images_in_use(&self) -> Result<HashSet<String>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|c| c.image_digest)
            .collect())
    }

    pub fn reserved_ports(&self) -> usize {
        self.inner.ports.reserved_count()
    }
}

impl Inner {
    fn live_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, LiveContainer>> {
        self.live.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move a persisted container to `next`, applying `edit` under the
    /// record lock.
    fn transition(
        &self,
        id: &str,
        next: ContainerStatus,
        edit: impl FnOnce(&mut Container),
    ) -> Result<Container> {
        self.store
            .update_record(RecordKind::Container, id, |current: Option<Container>| {
                let mut c =
                    current.ok_or_else(|| StevedoreError::ContainerNotFound(id.to_string()))?;
                if !c.status.can_transition_to(next) {
                    return Err(StevedoreError::InvalidTransition {
                        id: id.to_string(),
                        from: c.status.to_string(),
                        to: next.to_string(),
                    });
                }
                c.status = next;
                edit(&mut c);
                Ok(c)
            })
    }

    fn launch_failed(&self, id: &str, reason: String) -> StevedoreError {
        warn!(container = %id, %reason, "launch failed");
        let note = reason.clone();
        if let Err(e) = self.transition(id, ContainerStatus::Failed, |c| {
            c.finished_at = Some(Utc::now());
            c.warnings.push(format!("launch: {note}"));
        }) {
            warn!(container = %id, error = %e, "could not record launch failure");
        }
        StevedoreError::LaunchFailed {
            id: id.to_string(),
            reason,
        }
    }

    /// Best-effort release of per-container resources. The container
    /// directory is only removed once every volume is detached.
    fn release(
        &self,
        ctx: &IsolationContext,
        volumes: &[AttachedVolume],
        ports: &[PortMapping],
        run_dir: &Path,
    ) {
        if let Err(e) = self.isolation.teardown(ctx) {
            warn!(container = %ctx.container_id, error = %e, "isolation teardown failed");
        }
        self.ports.release(ports);

        let mut detached = true;
        for vol in volumes {
            if let Err(e) = volume::detach(vol) {
                warn!(container = %ctx.container_id, target = %vol.target.display(), error = %e, "volume detach failed");
                detached = false;
            }
        }
        if !detached {
            warn!(container = %ctx.container_id, dir = %run_dir.display(), "keeping container directory with attached volumes");
            return;
        }
        match std::fs::remove_dir_all(run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(container = %ctx.container_id, error = %e, "could not remove container directory")
            }
        }
    }
}

fn new_container_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

fn build_command(
    record: &Container,
    ctx: &IsolationContext,
    isolation: &dyn IsolationBackend,
) -> anyhow::Result<tokio::process::Command> {
    use anyhow::Context;

    let (program, args) = record
        .command
        .split_first()
        .context("container has no command")?;

    let mut cmd = tokio::process::Command::new(resolve_program(program, &record.rootfs, ctx));
    cmd.args(args)
        .envs(&record.env)
        .env("STEVEDORE_CONTAINER_ID", &record.id)
        .env("STEVEDORE_ROOTFS", &record.rootfs)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    for port in &record.ports {
        cmd.env(
            format!("STEVEDORE_PORT_{}", port.container_port),
            port.host_port.to_string(),
        );
    }

    if let Some(parent) = record.log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&record.log_path)
        .with_context(|| format!("opening log {}", record.log_path.display()))?;
    cmd.stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));

    isolation.prepare_command(ctx, &mut cmd, &record.rootfs);
    Ok(cmd)
}

/// Relative paths such as `./run` name files inside the container root.
/// Under chroot the kernel resolves them; otherwise anchor them here.
fn resolve_program(program: &str, rootfs: &Path, ctx: &IsolationContext) -> PathBuf {
    let path = Path::new(program);
    if !ctx.privileged && path.is_relative() && program.contains('/') {
        rootfs.join(path)
    } else {
        path.to_path_buf()
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: sending a signal has no memory-safety preconditions.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn signal_kill(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_ids_are_short_and_unique() {
        let a = new_container_id();
        let b = new_container_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn relative_programs_resolve_inside_rootfs_without_chroot() {
        let ctx = IsolationContext::default();
        let root = Path::new("/srv/c1/rootfs");
        assert_eq!(resolve_program("./run", root, &ctx), root.join("./run"));
        assert_eq!(resolve_program("sh", root, &ctx), PathBuf::from("sh"));

        let chrooted = IsolationContext {
            privileged: true,
            ..Default::default()
        };
        assert_eq!(resolve_program("./run", root, &chrooted), PathBuf::from("./run"));
    }
}
