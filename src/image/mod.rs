// src/image/mod.rs

//! Snapshot image catalog and extraction cache.
//!
//! An image is a single tar (optionally gzip) archive of a root filesystem.
//! Archives are content-addressed by their blake3 digest; extracted roots
//! are cached per digest under `rootfs/<digest>` and shared read-only by
//! every container created from the image.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{Result, StevedoreError};
use crate::store::{RecordKind, StateStore, atomic_copy};

pub mod extract;

pub use extract::DEFAULT_MAX_ROOTFS_BYTES;

/// Immutable snapshot image metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub tag: String,
    /// blake3 of the archive; the content identity.
    pub digest: String,
    pub archive_path: PathBuf,
    pub root_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Image {
    /// `name:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }

    fn record_key(&self) -> String {
        record_key(&self.name, &self.tag)
    }
}

/// Split `name[:tag]`, defaulting the tag to `latest`.
///
/// A colon inside a registry host (`host:5000/name`) is not a tag separator.
pub fn parse_reference(reference: &str) -> (String, String) {
    let reference = reference.trim();
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') && !name.is_empty() && !tag.is_empty() => {
            (name.to_string(), tag.to_string())
        }
        _ => (reference.to_string(), "latest".to_string()),
    }
}

fn record_key(name: &str, tag: &str) -> String {
    format!("{name}@{tag}")
}

/// Which images `prune` may remove.
#[derive(Debug, Clone, Default)]
pub struct PrunePolicy {
    /// Images unused for longer than this are candidates.
    pub max_unused_age: Duration,
    /// The most recently used N images are always kept.
    pub keep_last: usize,
    /// Digests referenced by live containers; never removed.
    pub in_use: HashSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// References of removed images.
    pub removed: Vec<String>,
    pub freed_bytes: u64,
}

/// Catalog of imported images plus the extraction cache.
#[derive(Debug)]
pub struct ImageStore {
    store: StateStore,
    max_rootfs_bytes: u64,
    /// One async mutex per digest so concurrent extractions collapse.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    extractions: AtomicUsize,
}

impl ImageStore {
    pub fn new(store: StateStore) -> Self {
        Self::with_size_limit(store, DEFAULT_MAX_ROOTFS_BYTES)
    }

    pub fn with_size_limit(store: StateStore, max_rootfs_bytes: u64) -> Self {
        Self {
            store,
            max_rootfs_bytes,
            inflight: Mutex::new(HashMap::new()),
            extractions: AtomicUsize::new(0),
        }
    }

    /// Number of extractions actually performed by this store.
    pub fn extraction_count(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }

    /// Import a snapshot archive under `name:tag`.
    ///
    /// The archive is copied into the store by digest; importing the same
    /// name and tag again replaces the record.
    pub fn import(&self, archive: &Path, name: &str, tag: &str) -> Result<Image> {
        if name.trim().is_empty() || tag.trim().is_empty() {
            return Err(StevedoreError::ConfigError(
                "image name and tag must not be empty".to_string(),
            ));
        }

        let digest = hash_archive(archive)?;
        let archive_path = self.store.archives_dir().join(format!("{digest}.tar"));
        let size_bytes = if archive_path.exists() {
            fs::metadata(&archive_path)?.len()
        } else {
            atomic_copy(archive, &archive_path)?
        };

        let now = Utc::now();
        let image = Image {
            name: name.to_string(),
            tag: tag.to_string(),
            root_path: self.cached_root(&digest),
            digest,
            archive_path,
            size_bytes,
            created_at: now,
            last_used: now,
        };
        self.store
            .write_record(RecordKind::Image, &image.record_key(), &image)?;

        info!(image = %image.reference(), digest = %image.digest, size_bytes, "image imported");
        Ok(image)
    }

    /// Look up an image by `name[:tag]`.
    pub fn get(&self, reference: &str) -> Result<Image> {
        let (name, tag) = parse_reference(reference);
        self.store
            .read_record(RecordKind::Image, &record_key(&name, &tag))?
            .ok_or_else(|| StevedoreError::ImageNotFound(format!("{name}:{tag}")))
    }

    pub fn list(&self) -> Result<Vec<Image>> {
        self.store.list_records(RecordKind::Image)
    }

    fn cached_root(&self, digest: &str) -> Option<PathBuf> {
        let root = self.store.rootfs_dir().join(digest);
        root.is_dir().then_some(root)
    }

    fn digest_lock(&self, digest: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(map.entry(digest.to_string()).or_default())
    }

    /// Extracted root of `image`, extracting it on first use.
    ///
    /// At most one extraction per digest is in flight; concurrent callers
    /// wait for it and then share the cached result.
    pub async fn extract(&self, image: &Image) -> Result<PathBuf> {
        if let Some(root) = self.cached_root(&image.digest) {
            self.touch(image, &root);
            return Ok(root);
        }

        let lock = self.digest_lock(&image.digest);
        let _guard = lock.lock().await;

        // Another caller may have finished while we waited.
        if let Some(root) = self.cached_root(&image.digest) {
            self.touch(image, &root);
            return Ok(root);
        }

        let dest = self.store.rootfs_dir().join(&image.digest);
        let tmp = self
            .store
            .rootfs_dir()
            .join(format!(".{}.{}.tmp", image.digest, Uuid::new_v4().simple()));
        let archive = image.archive_path.clone();
        let limit = self.max_rootfs_bytes;
        let reference = image.reference();

        debug!(image = %reference, digest = %image.digest, "extracting image");
        let unpack_tmp = tmp.clone();
        let unpacked = tokio::task::spawn_blocking(move || {
            extract::unpack_snapshot(&archive, &unpack_tmp, limit)
        })
        .await
        .map_err(|e| StevedoreError::ExtractionFailed {
            image: reference.clone(),
            reason: e.to_string(),
        })?;

        let bytes = match unpacked {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp);
                return Err(StevedoreError::ExtractionFailed {
                    image: reference,
                    reason: format!("{e:#}"),
                });
            }
        };

        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_dir_all(&tmp);
            return Err(StevedoreError::ExtractionFailed {
                image: reference,
                reason: format!("moving extracted root into place: {e}"),
            });
        }

        self.extractions.fetch_add(1, Ordering::SeqCst);
        info!(image = %reference, bytes, root = %dest.display(), "image extracted");
        self.touch(image, &dest);
        Ok(dest)
    }

    /// Record a use of the image. Failures only cost prune accuracy.
    fn touch(&self, image: &Image, root: &Path) {
        let key = image.record_key();
        let root = root.to_path_buf();
        let result = self.store.update_record(RecordKind::Image, &key, |current: Option<Image>| {
            let mut img = current.unwrap_or_else(|| image.clone());
            img.last_used = Utc::now();
            img.root_path = Some(root);
            Ok(img)
        });
        if let Err(e) = result {
            warn!(image = %image.reference(), error = %e, "failed to record image use");
        }
    }

    /// Remove an image record. Its archive and extracted root are removed
    /// once no other record shares the digest.
    ///
    /// Returns the bytes freed on disk.
    pub fn delete(&self, reference: &str) -> Result<u64> {
        let image = self.get(reference)?;
        self.store
            .remove_record(RecordKind::Image, &image.record_key())?;

        let shared = self.list()?.iter().any(|i| i.digest == image.digest);
        if shared {
            info!(image = %image.reference(), "image record removed; content still referenced");
            return Ok(0);
        }

        let mut freed = 0;
        if image.archive_path.exists() {
            freed += fs::metadata(&image.archive_path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&image.archive_path)?;
        }
        let root = self.store.rootfs_dir().join(&image.digest);
        if root.exists() {
            freed += extract::dir_size(&root);
            fs::remove_dir_all(&root)?;
        }

        info!(image = %image.reference(), freed_bytes = freed, "image deleted");
        Ok(freed)
    }

    /// Remove images unused for longer than `policy.max_unused_age`, except
    /// those in use and the `keep_last` most recently used.
    pub fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<PruneReport> {
        let mut images = self.list()?;
        images.sort_by(|a, b| b.last_used.cmp(&a.last_used));

        let max_age = chrono::Duration::from_std(policy.max_unused_age)
            .unwrap_or(chrono::Duration::MAX);
        let mut report = PruneReport::default();

        for image in images.into_iter().skip(policy.keep_last) {
            if policy.in_use.contains(&image.digest) {
                continue;
            }
            if now - image.last_used <= max_age {
                continue;
            }
            report.freed_bytes += self.delete(&image.reference())?;
            report.removed.push(image.reference());
        }

        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), freed_bytes = report.freed_bytes, "images pruned");
        }
        Ok(report)
    }
}

fn hash_archive(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file = File::open(path)
        .with_context(|| format!("opening image archive {}", path.display()))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references() {
        assert_eq!(parse_reference("alpine"), ("alpine".into(), "latest".into()));
        assert_eq!(parse_reference("etl:1.2"), ("etl".into(), "1.2".into()));
        assert_eq!(
            parse_reference("registry:5000/etl"),
            ("registry:5000/etl".into(), "latest".into())
        );
    }
}
