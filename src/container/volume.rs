// src/container/volume.rs

//! Attaching host directories inside a container root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::container::VolumeBinding;

/// How a volume ended up attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMethod {
    BindMount,
    Symlink,
}

/// A volume attached to a specific container root.
#[derive(Debug, Clone)]
pub struct AttachedVolume {
    pub binding: VolumeBinding,
    pub target: PathBuf,
    pub method: AttachMethod,
}

/// Attach `binding` under `rootfs`.
///
/// Bind mounts are used when `privileged`; otherwise (or if mounting fails)
/// a symlink is placed at the target. Returns a warning when the requested
/// semantics could not be honoured.
pub fn attach(
    rootfs: &Path,
    binding: &VolumeBinding,
    privileged: bool,
) -> Result<(AttachedVolume, Option<String>)> {
    let rel = binding
        .container_path
        .strip_prefix("/")
        .unwrap_or(&binding.container_path);
    let target = rootfs.join(rel);

    if !binding.host_path.exists() {
        fs::create_dir_all(&binding.host_path)
            .with_context(|| format!("creating volume source {}", binding.host_path.display()))?;
    }

    if privileged {
        match bind_mount(&binding.host_path, &target, binding.read_only) {
            Ok(()) => {
                debug!(target = %target.display(), "volume bind-mounted");
                return Ok((
                    AttachedVolume {
                        binding: binding.clone(),
                        target,
                        method: AttachMethod::BindMount,
                    },
                    None,
                ));
            }
            Err(e) => {
                warn!(target = %target.display(), error = %e, "bind mount failed; falling back to symlink");
            }
        }
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if target.symlink_metadata().is_ok() {
        remove_path(&target)?;
    }
    symlink_dir(&binding.host_path, &target)
        .with_context(|| format!("linking volume at {}", target.display()))?;

    let warning = binding.read_only.then(|| {
        format!(
            "volume {} is symlinked; read-only is not enforced",
            binding.container_path.display()
        )
    });
    debug!(target = %target.display(), "volume symlinked");
    Ok((
        AttachedVolume {
            binding: binding.clone(),
            target,
            method: AttachMethod::Symlink,
        },
        warning,
    ))
}

/// Describe a volume attached by an earlier process so it can be detached.
pub fn reattached(rootfs: &Path, binding: &VolumeBinding) -> AttachedVolume {
    let rel = binding
        .container_path
        .strip_prefix("/")
        .unwrap_or(&binding.container_path);
    let target = rootfs.join(rel);
    let method = match target.symlink_metadata() {
        Ok(meta) if meta.file_type().is_symlink() => AttachMethod::Symlink,
        _ => AttachMethod::BindMount,
    };
    AttachedVolume {
        binding: binding.clone(),
        target,
        method,
    }
}

/// Undo [`attach`]. After this the target no longer reaches host data, so
/// the container root can be removed safely.
pub fn detach(volume: &AttachedVolume) -> Result<()> {
    match volume.method {
        AttachMethod::BindMount => unmount(&volume.target),
        AttachMethod::Symlink => match fs::remove_file(&volume.target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        },
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn symlink_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink_dir(_src: &Path, _dst: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "volumes require a unix host",
    ))
}

#[cfg(target_os = "linux")]
fn bind_mount(src: &Path, dst: &Path, read_only: bool) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fs::create_dir_all(dst)?;
    let src_c = CString::new(src.as_os_str().as_bytes())?;
    let dst_c = CString::new(dst.as_os_str().as_bytes())?;

    // SAFETY: both strings are valid NUL-terminated paths for the duration
    // of the call; null fstype/data are allowed for bind mounts.
    let rc = unsafe {
        libc::mount(
            src_c.as_ptr(),
            dst_c.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("bind mount");
    }

    if read_only {
        // SAFETY: as above.
        let rc = unsafe {
            libc::mount(
                std::ptr::null(),
                dst_c.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            let _ = unmount(dst);
            return Err(err).context("read-only remount");
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_mount(_src: &Path, _dst: &Path, _read_only: bool) -> Result<()> {
    anyhow::bail!("bind mounts are only supported on linux")
}

#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(target.as_os_str().as_bytes())?;
    // SAFETY: `c` is a valid NUL-terminated path.
    let rc = unsafe { libc::umount2(c.as_ptr(), libc::MNT_DETACH) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) && err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err).context("unmounting volume");
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn unmount(_target: &Path) -> Result<()> {
    Ok(())
}
