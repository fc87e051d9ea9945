// src/container/rootfs.rs

//! Private per-container root directories.
//!
//! An extracted image is shared and must stay pristine, so each container
//! gets its own copy to write into.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Recursively copy `src` into `dst`, preserving symlinks as symlinks.
/// Returns the number of regular file bytes copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
    let mut copied = 0u64;
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from_dir, to_dir)) = stack.pop() {
        for entry in fs::read_dir(&from_dir)
            .with_context(|| format!("reading {}", from_dir.display()))?
        {
            let entry = entry?;
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                fs::create_dir_all(&to)?;
                stack.push((from, to));
            } else if file_type.is_symlink() {
                copy_symlink(&from, &to)?;
            } else {
                copied += fs::copy(&from, &to)
                    .with_context(|| format!("copying {}", from.display()))?;
            }
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)?;
    Ok(())
}
