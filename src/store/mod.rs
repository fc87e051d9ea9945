// src/store/mod.rs

//! Crash-safe, file-backed record store.
//!
//! Every record is a JSON document written through a temporary file and an
//! atomic rename, so readers only ever observe complete records. Writers of
//! the same record are serialized by a per-record [`RecordLock`].
//!
//! Layout under the store root:
//!
//! ```text
//! containers/<id>.json
//! images/<name>@<tag>.json
//! workflows/<name>.json
//! history/<workflow>.json
//! scheduler.json
//! logs/<workflow>/<task>/<execution>-<attempt>.log
//! logs/containers/<id>.log
//! archives/<digest>.tar
//! rootfs/<digest>/
//! run/<container id>/
//! locks/<kind>/<key>.lock
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::container::Container;
use crate::dag::history::ExecutionHistory;
use crate::errors::Result;
use crate::image::Image;
use crate::scheduler::registry::SchedulerRegistry;

pub mod lock;
pub mod watch;

pub use lock::RecordLock;
pub use watch::{StoreChange, StoreSubscription};

/// Category of persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Container,
    Image,
    Workflow,
    History,
    Scheduler,
}

impl RecordKind {
    pub fn dir(self) -> &'static str {
        match self {
            RecordKind::Container => "containers",
            RecordKind::Image => "images",
            RecordKind::Workflow => "workflows",
            RecordKind::History => "history",
            RecordKind::Scheduler => "scheduler",
        }
    }

    pub(crate) fn from_dir(dir: &str) -> Option<Self> {
        match dir {
            "containers" => Some(RecordKind::Container),
            "images" => Some(RecordKind::Image),
            "workflows" => Some(RecordKind::Workflow),
            "history" => Some(RecordKind::History),
            _ => None,
        }
    }
}

/// Consistent-enough view of the store for dashboards and `ps`.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub containers: Vec<Container>,
    pub images: Vec<Image>,
    pub histories: Vec<ExecutionHistory>,
    pub scheduler: SchedulerRegistry,
}

/// Handle on a state directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [
            "containers",
            "images",
            "workflows",
            "history",
            "logs",
            "archives",
            "rootfs",
            "run",
            "locks",
        ] {
            fs::create_dir_all(root.join(dir))?;
        }
        debug!(root = %root.display(), "state store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.root.join("archives")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn record_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        match kind {
            RecordKind::Scheduler => self.root.join("scheduler.json"),
            _ => self
                .root
                .join(kind.dir())
                .join(format!("{}.json", sanitize_key(key))),
        }
    }

    fn lock_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(kind.dir())
            .join(format!("{}.lock", sanitize_key(key)))
    }

    /// Exclusive lock scoped to one record identity.
    pub fn lock(&self, kind: RecordKind, key: &str) -> Result<RecordLock> {
        RecordLock::acquire(self.lock_path(kind, key))
    }

    /// Replace a record atomically.
    pub fn write_record<T: Serialize>(&self, kind: RecordKind, key: &str, value: &T) -> Result<()> {
        let _lock = self.lock(kind, key)?;
        self.write_unlocked(kind, key, value)
    }

    fn write_unlocked<T: Serialize>(&self, kind: RecordKind, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        atomic_write(&self.record_path(kind, key), &bytes)
    }

    pub fn read_record<T: DeserializeOwned>(&self, kind: RecordKind, key: &str) -> Result<Option<T>> {
        read_json(&self.record_path(kind, key))
    }

    /// All readable records of a kind. Unparseable files are skipped with a
    /// warning.
    pub fn list_records<T: DeserializeOwned>(&self, kind: RecordKind) -> Result<Vec<T>> {
        if kind == RecordKind::Scheduler {
            return Ok(self.read_record(kind, "registry")?.into_iter().collect());
        }

        let dir = self.root.join(kind.dir());
        let mut paths: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension().is_some_and(|ext| ext == "json")
                        && !p
                            .file_name()
                            .is_some_and(|n| n.to_string_lossy().starts_with('.'))
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// Remove a record. Removing a missing record is not an error.
    pub fn remove_record(&self, kind: RecordKind, key: &str) -> Result<()> {
        let _lock = self.lock(kind, key)?;
        match fs::remove_file(self.record_path(kind, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write a record while holding its lock.
    ///
    /// `f` receives the current value (if any) and returns the value to
    /// store; an error from `f` leaves the record untouched.
    pub fn update_record<T, F>(&self, kind: RecordKind, key: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T>,
    {
        let _lock = self.lock(kind, key)?;
        let current = self.read_record(kind, key)?;
        let next = f(current)?;
        self.write_unlocked(kind, key, &next)?;
        Ok(next)
    }

    /// Current containers, images, histories and scheduler registry.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(StoreSnapshot {
            containers: self.list_records(RecordKind::Container)?,
            images: self.list_records(RecordKind::Image)?,
            histories: self.list_records(RecordKind::History)?,
            scheduler: self
                .read_record(RecordKind::Scheduler, "registry")?
                .unwrap_or_default(),
        })
    }

    /// Stream of record changes, for readers that want to follow the store.
    pub fn subscribe(&self) -> Result<StoreSubscription> {
        watch::subscribe(&self.root)
    }

    /// Log file for one attempt of one task.
    pub fn log_path(&self, workflow: &str, task: &str, execution_id: &str, attempt: u32) -> PathBuf {
        self.root
            .join("logs")
            .join(sanitize_key(workflow))
            .join(sanitize_key(task))
            .join(format!("{}-{}.log", sanitize_key(execution_id), attempt))
    }

    /// Log file for a container not owned by a workflow task.
    pub fn container_log_path(&self, container_id: &str) -> PathBuf {
        self.root
            .join("logs")
            .join("containers")
            .join(format!("{}.log", sanitize_key(container_id)))
    }

    /// Delete log files last modified before `now - retention`.
    ///
    /// Returns the number of files removed.
    pub fn prune_logs(&self, retention: Duration) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let mut stack = vec![self.root.join("logs")];

        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else if meta.modified().is_ok_and(|m| m < cutoff) {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "pruned old log files");
        }
        Ok(removed)
    }
}

/// Map a record key to a file stem, reversibly.
///
/// Bytes outside `[A-Za-z0-9._@:-]` (and a leading `.`) are written as
/// `%XX`, so distinct keys never share a file and no key can name a path
/// outside its directory. The empty key is stored as `%`.
fn sanitize_key(key: &str) -> String {
    if key.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(key.len());
    for (i, b) in key.bytes().enumerate() {
        match b {
            b'.' if i == 0 => out.push_str("%2E"),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'@' | b':' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Inverse of [`sanitize_key`]. `None` for stems it cannot have produced.
pub(crate) fn decode_key(stem: &str) -> Option<String> {
    if stem == "%" {
        return Some(String::new());
    }
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `bytes` to `path` via a uniquely named sibling temp file, fsync and
/// rename. The temp file is removed on failure.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = temp_sibling(path);

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;
    sync_dir(dir);
    Ok(())
}

/// Copy `src` to `dest` with the same temp-then-rename discipline.
pub(crate) fn atomic_copy(src: &Path, dest: &Path) -> Result<u64> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = temp_sibling(dest);

    let result = (|| -> std::io::Result<u64> {
        let copied = fs::copy(src, &tmp)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, dest)?;
        Ok(copied)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    let copied = result?;
    sync_dir(dir);
    Ok(copied)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4().simple()))
}

fn sync_dir(dir: &Path) {
    // Persists the rename itself; not every platform allows opening dirs.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}
