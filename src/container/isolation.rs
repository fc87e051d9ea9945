// src/container/isolation.rs

//! Process isolation backends.
//!
//! The runtime never talks to the kernel directly; it goes through an
//! [`IsolationBackend`]. Two backends exist:
//!
//! - [`HostIsolation`]: a plain host process. Limits cannot be enforced and
//!   are reported back as [`StevedoreError::ResourceLimitUnsupported`].
//! - [`CgroupIsolation`]: Linux cgroup v2 for memory/CPU ceilings, plus
//!   new UTS/IPC/mount namespaces and a chroot when running as root.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::container::ResourceLimits;
use crate::errors::{Result, StevedoreError};
use crate::types::IsolationMode;

/// Cgroup v2 period used for `cpu.max`, in microseconds.
const CPU_PERIOD_US: u64 = 100_000;

/// Per-container state handed back by [`IsolationBackend::create`].
#[derive(Debug, Clone, Default)]
pub struct IsolationContext {
    pub container_id: String,
    pub cgroup: Option<PathBuf>,
    /// Namespaces, chroot and bind mounts are available.
    pub privileged: bool,
    /// Setup partially failed; the container runs with weaker guarantees.
    pub degraded: bool,
}

pub trait IsolationBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Allocate whatever per-container kernel objects the backend needs.
    fn create(&self, container_id: &str) -> Result<IsolationContext>;

    /// Rebuild the context of a container created by an earlier process.
    fn resume(&self, container_id: &str) -> IsolationContext {
        IsolationContext {
            container_id: container_id.to_string(),
            ..Default::default()
        }
    }

    /// Apply resource ceilings. Unlimited limits are always accepted.
    fn apply_limits(&self, ctx: &IsolationContext, limits: &ResourceLimits) -> Result<()>;

    /// Configure `cmd` to run inside `rootfs`.
    fn prepare_command(
        &self,
        ctx: &IsolationContext,
        cmd: &mut tokio::process::Command,
        rootfs: &Path,
    );

    /// Move a freshly spawned process into the container.
    fn attach_process(&self, ctx: &IsolationContext, pid: u32) -> Result<()>;

    /// Release kernel objects. Must be idempotent.
    fn teardown(&self, ctx: &IsolationContext) -> Result<()>;
}

/// No isolation: processes run as ordinary children with `rootfs` as cwd.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostIsolation;

impl IsolationBackend for HostIsolation {
    fn name(&self) -> &'static str {
        "host"
    }

    fn create(&self, container_id: &str) -> Result<IsolationContext> {
        Ok(IsolationContext {
            container_id: container_id.to_string(),
            ..Default::default()
        })
    }

    fn apply_limits(&self, _ctx: &IsolationContext, limits: &ResourceLimits) -> Result<()> {
        if limits.is_unlimited() {
            return Ok(());
        }
        Err(StevedoreError::ResourceLimitUnsupported {
            backend: self.name().to_string(),
            limit: describe_limits(limits),
        })
    }

    fn prepare_command(
        &self,
        _ctx: &IsolationContext,
        cmd: &mut tokio::process::Command,
        rootfs: &Path,
    ) {
        cmd.current_dir(rootfs);
    }

    fn attach_process(&self, _ctx: &IsolationContext, _pid: u32) -> Result<()> {
        Ok(())
    }

    fn teardown(&self, _ctx: &IsolationContext) -> Result<()> {
        Ok(())
    }
}

/// Linux cgroup v2 backend rooted at `<cgroup_root>/stevedore`.
#[derive(Debug, Clone)]
pub struct CgroupIsolation {
    parent: PathBuf,
    privileged: bool,
}

impl CgroupIsolation {
    pub fn new(cgroup_root: impl Into<PathBuf>, privileged: bool) -> Self {
        Self {
            parent: cgroup_root.into().join("stevedore"),
            privileged,
        }
    }

    fn enable_controllers(&self) {
        // Best effort: fails harmlessly when already enabled or delegated.
        if let Some(root) = self.parent.parent() {
            let _ = std::fs::write(root.join("cgroup.subtree_control"), "+memory +cpu");
        }
        let _ = std::fs::write(self.parent.join("cgroup.subtree_control"), "+memory +cpu");
    }
}

impl IsolationBackend for CgroupIsolation {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    fn create(&self, container_id: &str) -> Result<IsolationContext> {
        std::fs::create_dir_all(&self.parent)?;
        self.enable_controllers();
        let dir = self.parent.join(container_id);
        std::fs::create_dir_all(&dir)?;
        debug!(container = container_id, cgroup = %dir.display(), "cgroup created");
        Ok(IsolationContext {
            container_id: container_id.to_string(),
            cgroup: Some(dir),
            privileged: self.privileged,
            degraded: false,
        })
    }

    fn resume(&self, container_id: &str) -> IsolationContext {
        let dir = self.parent.join(container_id);
        IsolationContext {
            container_id: container_id.to_string(),
            cgroup: dir.is_dir().then_some(dir),
            privileged: self.privileged,
            degraded: false,
        }
    }

    fn apply_limits(&self, ctx: &IsolationContext, limits: &ResourceLimits) -> Result<()> {
        if limits.is_unlimited() {
            return Ok(());
        }
        let Some(dir) = &ctx.cgroup else {
            return Err(StevedoreError::ResourceLimitUnsupported {
                backend: self.name().to_string(),
                limit: describe_limits(limits),
            });
        };
        let unsupported = |limit: String| StevedoreError::ResourceLimitUnsupported {
            backend: self.name().to_string(),
            limit,
        };
        if let Some(bytes) = limits.memory_bytes {
            std::fs::write(dir.join("memory.max"), bytes.to_string())
                .map_err(|e| unsupported(format!("memory={bytes} ({e})")))?;
        }
        if let Some(pct) = limits.cpu_percent {
            let quota = u64::from(pct) * CPU_PERIOD_US / 100;
            std::fs::write(dir.join("cpu.max"), format!("{quota} {CPU_PERIOD_US}"))
                .map_err(|e| unsupported(format!("cpu={pct}% ({e})")))?;
        }
        Ok(())
    }

    fn prepare_command(
        &self,
        ctx: &IsolationContext,
        cmd: &mut tokio::process::Command,
        rootfs: &Path,
    ) {
        cmd.current_dir(rootfs);
        // Join before the chroot, while the cgroup path still resolves.
        if let Some(dir) = &ctx.cgroup {
            join_cgroup_before_exec(cmd, dir);
        }
        if ctx.privileged {
            enter_sandbox(cmd, rootfs);
        }
    }

    /// Fallback for when the pre-exec join failed. Writing a pid that is
    /// already a member is a no-op.
    fn attach_process(&self, ctx: &IsolationContext, pid: u32) -> Result<()> {
        if let Some(dir) = &ctx.cgroup {
            std::fs::write(dir.join("cgroup.procs"), pid.to_string())?;
        }
        Ok(())
    }

    fn teardown(&self, ctx: &IsolationContext) -> Result<()> {
        let Some(dir) = &ctx.cgroup else {
            return Ok(());
        };
        match std::fs::remove_dir(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(target_os = "linux")]
fn cgroup_procs_path(cgroup: &Path) -> Option<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(cgroup.join("cgroup.procs").as_os_str().as_bytes()).ok()
}

/// Make the child write itself into `cgroup` before it execs, so it never
/// runs outside its limits. Writing `0` to `cgroup.procs` moves the writer.
///
/// Failures are ignored here (nothing can be logged after fork); the
/// runtime's `attach_process` call reports them.
#[cfg(target_os = "linux")]
fn join_cgroup_before_exec(cmd: &mut tokio::process::Command, cgroup: &Path) {
    let Some(procs) = cgroup_procs_path(cgroup) else {
        warn!(cgroup = %cgroup.display(), "cgroup path contains NUL; joining after spawn");
        return;
    };
    // SAFETY: only open/write/close on a path allocated before the fork.
    unsafe {
        cmd.pre_exec(move || {
            let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
            if fd >= 0 {
                libc::write(fd, b"0".as_ptr().cast(), 1);
                libc::close(fd);
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn join_cgroup_before_exec(_cmd: &mut tokio::process::Command, _cgroup: &Path) {}

#[cfg(target_os = "linux")]
fn enter_sandbox(cmd: &mut tokio::process::Command, rootfs: &Path) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(root) = CString::new(rootfs.as_os_str().as_bytes()) else {
        warn!(rootfs = %rootfs.display(), "rootfs path contains NUL; skipping chroot");
        return;
    };
    // SAFETY: the closure runs between fork and exec and only calls
    // async-signal-safe libc functions on memory allocated before the fork.
    unsafe {
        cmd.pre_exec(move || {
            if libc::unshare(libc::CLONE_NEWUTS | libc::CLONE_NEWIPC | libc::CLONE_NEWNS) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chroot(root.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chdir(c"/".as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn enter_sandbox(_cmd: &mut tokio::process::Command, _rootfs: &Path) {}

fn describe_limits(limits: &ResourceLimits) -> String {
    let mut parts = Vec::new();
    if let Some(bytes) = limits.memory_bytes {
        parts.push(format!("memory={bytes}"));
    }
    if let Some(pct) = limits.cpu_percent {
        parts.push(format!("cpu={pct}%"));
    }
    parts.join(", ")
}

/// Pick a backend for `mode`.
///
/// `Auto` uses cgroups only when running as root on a cgroup v2 host.
/// `Cgroup` on an unsuitable host falls back to [`HostIsolation`] with a
/// warning rather than refusing to run.
pub fn detect_backend(mode: IsolationMode) -> Arc<dyn IsolationBackend> {
    let root = Path::new("/sys/fs/cgroup");
    let cgroup_v2 = cfg!(target_os = "linux") && root.join("cgroup.controllers").exists();
    let privileged = is_root();

    match mode {
        IsolationMode::Host => Arc::new(HostIsolation),
        IsolationMode::Cgroup if cgroup_v2 => {
            if !privileged {
                warn!("cgroup isolation requested without root; limits may fail to apply");
            }
            Arc::new(CgroupIsolation::new(root, privileged))
        }
        IsolationMode::Cgroup => {
            warn!("cgroup v2 not available; falling back to host isolation");
            Arc::new(HostIsolation)
        }
        IsolationMode::Auto if cgroup_v2 && privileged => {
            info!("using cgroup isolation");
            Arc::new(CgroupIsolation::new(root, true))
        }
        IsolationMode::Auto => {
            info!("using host isolation; resource limits will not be enforced");
            Arc::new(HostIsolation)
        }
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_backend_rejects_limits_but_accepts_unlimited() {
        let host = HostIsolation;
        let ctx = host.create("abc").unwrap();
        assert!(host.apply_limits(&ctx, &ResourceLimits::default()).is_ok());

        let err = host
            .apply_limits(
                &ctx,
                &ResourceLimits {
                    memory_bytes: Some(1024),
                    cpu_percent: Some(50),
                },
            )
            .unwrap_err();
        match err {
            StevedoreError::ResourceLimitUnsupported { backend, limit } => {
                assert_eq!(backend, "host");
                assert_eq!(limit, "memory=1024, cpu=50%");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cgroup_backend_writes_limit_files_under_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CgroupIsolation::new(dir.path(), false);
        let ctx = backend.create("c1").unwrap();
        let cg = ctx.cgroup.clone().unwrap();
        assert!(cg.starts_with(dir.path().join("stevedore")));

        backend
            .apply_limits(
                &ctx,
                &ResourceLimits {
                    memory_bytes: Some(64 * 1024 * 1024),
                    cpu_percent: Some(25),
                },
            )
            .unwrap();
        assert_eq!(std::fs::read_to_string(cg.join("memory.max")).unwrap(), "67108864");
        assert_eq!(std::fs::read_to_string(cg.join("cpu.max")).unwrap(), "25000 100000");

        // Plain directory with files in it: teardown reports the failure
        // rather than deleting recursively.
        assert!(backend.teardown(&ctx).is_err());
        std::fs::remove_file(cg.join("memory.max")).unwrap();
        std::fs::remove_file(cg.join("cpu.max")).unwrap();
        backend.teardown(&ctx).unwrap();
        backend.teardown(&ctx).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn procs_path_points_inside_the_cgroup() {
        let procs = cgroup_procs_path(Path::new("/sys/fs/cgroup/stevedore/c1")).unwrap();
        assert_eq!(procs.to_str().unwrap(), "/sys/fs/cgroup/stevedore/c1/cgroup.procs");
        assert!(cgroup_procs_path(Path::new("/bad\0path")).is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn child_joins_the_cgroup_before_exec() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CgroupIsolation::new(dir.path(), false);
        let ctx = backend.create("c1").unwrap();
        let cg = ctx.cgroup.clone().unwrap();
        std::fs::write(cg.join("cgroup.procs"), "").unwrap();

        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "exit 0"]);
        backend.prepare_command(&ctx, &mut cmd, dir.path());
        let status = cmd.status().await.unwrap();
        assert!(status.success());

        // The hook ran in the child, before `attach_process` was ever called.
        assert_eq!(std::fs::read_to_string(cg.join("cgroup.procs")).unwrap(), "0");
    }
}
