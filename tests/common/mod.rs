#![allow(dead_code)]

use std::sync::Arc;

use stevedore::container::{ContainerRuntime, HostIsolation, RuntimeSettings};
use stevedore::image::ImageStore;
use stevedore::store::StateStore;
use tempfile::TempDir;

pub use stevedore_test_utils::{init_tracing, with_timeout};

/// A fresh state store in a temporary directory. Keep the `TempDir` alive
/// for as long as the store is used.
pub fn temp_store() -> (TempDir, StateStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::open(dir.path().join("state")).expect("open store");
    (dir, store)
}

/// Image store plus a host-isolated container runtime over `store`.
pub fn host_runtime(store: &StateStore) -> (Arc<ImageStore>, ContainerRuntime) {
    let images = Arc::new(ImageStore::new(store.clone()));
    let runtime = ContainerRuntime::new(
        store.clone(),
        Arc::clone(&images),
        Arc::new(HostIsolation),
        RuntimeSettings::default(),
    );
    (images, runtime)
}
