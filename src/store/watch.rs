// src/store/watch.rs

//! Change notifications for external readers of the state directory.

use std::path::{Path, PathBuf};

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::Result;
use crate::store::RecordKind;

/// A record was created, replaced or removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreChange {
    pub kind: RecordKind,
    pub key: String,
}

/// Live subscription to store changes.
///
/// Keeps the underlying `RecommendedWatcher` alive; dropping it stops the
/// feed.
pub struct StoreSubscription {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<StoreChange>,
}

impl std::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSubscription").finish_non_exhaustive()
    }
}

impl StoreSubscription {
    /// Next change, or `None` once the watcher is gone.
    pub async fn recv(&mut self) -> Option<StoreChange> {
        self.rx.recv().await
    }
}

/// Watch `root` recursively and translate file events into record changes.
pub(crate) fn subscribe(root: &Path) -> Result<StoreSubscription> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let (change_tx, change_rx) = mpsc::unbounded_channel::<StoreChange>();

    // Closure called synchronously by notify whenever an event arrives.
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(err) => {
                // No tracing context on notify's thread; stderr is all we have.
                eprintln!("stevedore: state watch error: {err}");
            }
        },
        Config::default(),
    )
    .map_err(anyhow::Error::from)?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(anyhow::Error::from)?;
    info!(root = %root.display(), "watching state store");

    let async_root = root.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            for path in event.paths {
                if let Some(change) = classify(&async_root, &path) {
                    debug!(?change, "store record changed");
                    if change_tx.send(change).is_err() {
                        return;
                    }
                }
            }
        }
        debug!("store watch loop finished");
    });

    Ok(StoreSubscription {
        _watcher: watcher,
        rx: change_rx,
    })
}

/// Map a filesystem path inside the store to the record it represents.
///
/// Temporary files, lock files, logs and image data are ignored.
pub(crate) fn classify(root: &Path, path: &Path) -> Option<StoreChange> {
    let rel: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
    let mut parts = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned());
    let first = parts.next()?;

    if first == "scheduler.json" {
        return Some(StoreChange {
            kind: RecordKind::Scheduler,
            key: "registry".to_string(),
        });
    }

    let kind = RecordKind::from_dir(&first)?;
    let file = parts.next()?;
    if parts.next().is_some() || file.starts_with('.') {
        return None;
    }
    let key = super::decode_key(file.strip_suffix(".json")?)?;
    Some(StoreChange { kind, key })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_records_and_ignores_noise() {
        let root = Path::new("/state");
        assert_eq!(
            classify(root, Path::new("/state/containers/abc.json")),
            Some(StoreChange {
                kind: RecordKind::Container,
                key: "abc".into()
            })
        );
        assert_eq!(
            classify(root, Path::new("/state/scheduler.json")).map(|c| c.kind),
            Some(RecordKind::Scheduler)
        );
        assert_eq!(
            classify(root, Path::new("/state/workflows/etl%2Fdaily.json")).map(|c| c.key),
            Some("etl/daily".to_string())
        );
        assert_eq!(classify(root, Path::new("/state/containers/.abc.json.1.tmp")), None);
        assert_eq!(classify(root, Path::new("/state/locks/containers/abc.lock")), None);
        assert_eq!(classify(root, Path::new("/state/logs/wf/t/e-1.log")), None);
    }
}
