// src/image/extract.rs

//! Unpacking of snapshot archives into a directory tree.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Component, Path};

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

/// Default ceiling on the total unpacked size of one image (4 GiB).
pub const DEFAULT_MAX_ROOTFS_BYTES: u64 = 4 << 30;

/// Unpack a (optionally gzip-compressed) tar archive into `dest`.
///
/// Entries whose path is absolute or contains `..` are rejected, as is an
/// archive whose entries add up to more than `max_bytes`. `dest` must not
/// contain anything the caller wants to keep; on error it is left partially
/// populated for the caller to discard.
pub fn unpack_snapshot(archive_path: &Path, dest: &Path, max_bytes: u64) -> Result<u64> {
    fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;

    let mut file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let gzipped = is_gzip(&mut file)?;
    let reader = BufReader::new(file);

    if gzipped {
        unpack_entries(Archive::new(GzDecoder::new(reader)), dest, max_bytes)
    } else {
        unpack_entries(Archive::new(reader), dest, max_bytes)
    }
}

fn is_gzip(file: &mut File) -> Result<bool> {
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

fn unpack_entries<R: Read>(mut archive: Archive<R>, dest: &Path, max_bytes: u64) -> Result<u64> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut total: u64 = 0;
    let mut count = 0usize;

    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let path = entry.path().context("decoding entry path")?.into_owned();

        if !is_contained(&path) {
            bail!("archive entry '{}' escapes the image root", path.display());
        }

        total = total.saturating_add(entry.size());
        if total > max_bytes {
            bail!("image exceeds the unpacked size limit of {max_bytes} bytes");
        }

        let unpacked = entry
            .unpack_in(dest)
            .with_context(|| format!("unpacking '{}'", path.display()))?;
        if !unpacked {
            bail!("archive entry '{}' was refused by the unpacker", path.display());
        }
        count += 1;
    }

    debug!(entries = count, bytes = total, dest = %dest.display(), "snapshot unpacked");
    Ok(total)
}

/// Relative path with no parent-directory hops.
fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Total size of regular files below `path` (0 if it does not exist).
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(entry.path()),
                Ok(ft) if ft.is_file() => {
                    total += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
                _ => {}
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_rules() {
        assert!(is_contained(Path::new("bin/sh")));
        assert!(is_contained(Path::new("./etc/passwd")));
        assert!(!is_contained(Path::new("../etc/passwd")));
        assert!(!is_contained(Path::new("a/../../b")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }

    #[test]
    fn rejects_traversal_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive).unwrap());
            let data = b"pwned";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            // `append_data` refuses `..`, so write the raw name.
            {
                let name = b"../escape.txt";
                let gnu = header.as_gnu_mut().unwrap();
                gnu.name[..name.len()].copy_from_slice(name);
            }
            header.set_cksum();
            builder.append(&header, &data[..]).unwrap();
            builder.finish().unwrap();
        }

        let dest = dir.path().join("root");
        let err = unpack_snapshot(&archive, &dest, DEFAULT_MAX_ROOTFS_BYTES).unwrap_err();
        assert!(err.to_string().contains("escapes"), "{err}");
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn enforces_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("big.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive).unwrap());
            let data = vec![7u8; 4096];
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "blob.bin", &data[..]).unwrap();
            builder.finish().unwrap();
        }

        let err = unpack_snapshot(&archive, &dir.path().join("root"), 1024).unwrap_err();
        assert!(err.to_string().contains("size limit"), "{err}");
    }
}
