// tests/store.rs

mod common;

use std::time::Duration;

use std::sync::Arc;

use stevedore::dag::{DagEngine, EngineSettings, RunOptions, load_history, record_execution};
use stevedore::store::{RecordKind, StoreChange};
use stevedore_test_utils::builders::WorkflowBuilder;
use stevedore_test_utils::fake_executor::ScriptedExecutor;

use crate::common::{init_tracing, temp_store, with_timeout};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Marker {
    note: String,
}

#[tokio::test]
async fn subscribers_see_record_writes_and_removals() {
    init_tracing();
    let (_dir, store) = temp_store();
    let mut changes = store.subscribe().unwrap();

    let marker = Marker {
        note: "hello".to_string(),
    };
    store
        .write_record(RecordKind::Container, "c1", &marker)
        .unwrap();

    let wanted = StoreChange {
        kind: RecordKind::Container,
        key: "c1".to_string(),
    };
    with_timeout(async {
        while let Some(change) = changes.recv().await {
            // Temporary siblings are never reported.
            assert!(!change.key.starts_with('.'), "{change:?}");
            if change == wanted {
                break;
            }
        }
    })
    .await;

    store.remove_record(RecordKind::Container, "c1").unwrap();
    let seen = with_timeout(changes.recv()).await;
    assert_eq!(seen, Some(wanted));
}

#[tokio::test]
async fn snapshot_collects_histories_and_scheduler_state() {
    init_tracing();
    let (_dir, store) = temp_store();

    let empty = store.snapshot().unwrap();
    assert!(empty.containers.is_empty());
    assert!(empty.histories.is_empty());
    assert!(empty.scheduler.jobs.is_empty());

    let wf = WorkflowBuilder::new("etl").task("only", &[]).build();
    let engine = DagEngine::new(
        Arc::new(ScriptedExecutor::new()),
        store.clone(),
        EngineSettings::default(),
    );
    let execution = engine
        .run(&wf, RunOptions::manual())
        .await
        .unwrap()
        .into_execution()
        .unwrap();

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.histories.len(), 1);
    assert_eq!(
        snapshot.histories[0].latest().map(|e| e.id.clone()),
        Some(execution.id.clone())
    );

    record_execution(&store, 10, execution.clone()).unwrap();
    assert_eq!(load_history(&store, "etl").unwrap().len(), 2);

    // A smaller limit trims the persisted history on the next write.
    let trimmed = record_execution(&store, 1, execution).unwrap();
    assert_eq!(trimmed.len(), 1);
    assert_eq!(store.snapshot().unwrap().histories[0].limit, 1);
}

#[test]
fn old_logs_are_pruned() {
    let (_dir, store) = temp_store();
    let log = store.log_path("etl", "extract", "run-1", 1);
    std::fs::create_dir_all(log.parent().unwrap()).unwrap();
    std::fs::write(&log, "line\n").unwrap();
    assert!(log.starts_with(store.root().join("logs").join("etl").join("extract")));

    assert_eq!(store.prune_logs(Duration::from_secs(3600)).unwrap(), 0);
    assert!(log.exists());

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(store.prune_logs(Duration::ZERO).unwrap(), 1);
    assert!(!log.exists());
}
