// tests/container_lifecycle.rs
#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stevedore::container::{
    Container, ContainerSpec, ContainerStatus, PortRequest, ResourceLimits,
};
use stevedore::dag::{DagEngine, EngineSettings, ExecutionStatus, RunOptions, TaskState};
use stevedore::errors::StevedoreError;
use stevedore::exec::ContainerTaskExecutor;
use stevedore::store::RecordKind;
use stevedore_test_utils::builders::{TaskBuilder, WorkflowBuilder};
use stevedore_test_utils::images::{write_basic_snapshot, write_escaping_snapshot};

use crate::common::{host_runtime, init_tracing, temp_store, with_timeout};

fn shell(image: &str, script: &str) -> ContainerSpec {
    ContainerSpec {
        image: image.to_string(),
        command: vec!["sh".into(), "-c".into(), script.into()],
        ..Default::default()
    }
}

fn log_of(container: &Container) -> String {
    std::fs::read_to_string(&container.log_path).unwrap_or_default()
}

#[tokio::test]
async fn create_start_wait_delete() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let created = runtime
        .create(shell(
            "app:v1",
            "echo id=$STEVEDORE_CONTAINER_ID; cat data/hello.txt",
        ))
        .await
        .unwrap();
    assert_eq!(created.status, ContainerStatus::Created);
    assert!(created.rootfs.join("data/hello.txt").is_file());
    // Each container gets its own copy of the image root.
    let shared = images.get("app:v1").unwrap().root_path.unwrap();
    assert_ne!(created.rootfs, shared);

    let running = runtime.start(&created.id).await.unwrap();
    assert_eq!(running.status, ContainerStatus::Running);
    assert!(running.pid.is_some());

    let exit = with_timeout(runtime.wait(&created.id, None)).await.unwrap();
    assert_eq!(exit.status, ContainerStatus::Succeeded);
    assert_eq!(exit.exit_code, Some(0));

    let finished = runtime.get(&created.id).unwrap();
    assert_eq!(finished.status, ContainerStatus::Succeeded);
    let log = log_of(&finished);
    assert!(log.contains(&format!("id={}", created.id)), "{log}");
    assert!(log.contains("hello from the image"), "{log}");

    let deleted = runtime.delete(&created.id).await.unwrap().unwrap();
    assert_eq!(deleted.status, ContainerStatus::Deleted);
    assert!(!store.run_dir().join(&created.id).exists());
    assert!(matches!(
        runtime.get(&created.id),
        Err(StevedoreError::ContainerNotFound(_))
    ));

    // Deleting again is a no-op.
    assert!(runtime.delete(&created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn image_run_script_is_resolved_inside_the_root() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "svc"), "svc", "latest")
        .unwrap();

    let spec = ContainerSpec {
        image: "svc".to_string(),
        command: vec!["./run".to_string()],
        ..Default::default()
    };
    let c = runtime.create(spec).await.unwrap();
    runtime.start(&c.id).await.unwrap();
    let exit = with_timeout(runtime.wait(&c.id, None)).await.unwrap();

    assert_eq!(exit.status, ContainerStatus::Succeeded);
    assert!(log_of(&runtime.get(&c.id).unwrap()).contains("ready"));
}

#[tokio::test]
async fn non_zero_exit_is_failed_with_code() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let c = runtime.create(shell("app:v1", "exit 3")).await.unwrap();
    runtime.start(&c.id).await.unwrap();
    let exit = with_timeout(runtime.wait(&c.id, None)).await.unwrap();

    assert_eq!(exit.status, ContainerStatus::Failed);
    assert_eq!(exit.exit_code, Some(3));
    assert!(runtime.get(&c.id).unwrap().finished_at.is_some());
}

#[tokio::test]
async fn wait_times_out_and_kill_reaps() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let c = runtime.create(shell("app:v1", "sleep 30")).await.unwrap();
    runtime.start(&c.id).await.unwrap();

    match runtime.wait(&c.id, Some(Duration::from_millis(100))).await {
        Err(StevedoreError::TimeoutExceeded { id, .. }) => assert_eq!(id, c.id),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(runtime.get(&c.id).unwrap().status, ContainerStatus::Running);

    let stats = runtime.observe(&c.id).unwrap();
    assert!(stats.uptime > Duration::ZERO);

    let killed = with_timeout(runtime.kill(&c.id)).await.unwrap();
    assert_eq!(killed.status, ContainerStatus::Killed);
    assert_eq!(runtime.get(&c.id).unwrap().status, ContainerStatus::Killed);

    // Killing an exited container reports its exit again.
    let again = runtime.kill(&c.id).await.unwrap();
    assert_eq!(again.status, ContainerStatus::Killed);
}

#[tokio::test]
async fn lifecycle_rejects_out_of_order_operations() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let c = runtime.create(shell("app:v1", "true")).await.unwrap();
    assert!(matches!(
        runtime.kill(&c.id).await,
        Err(StevedoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        runtime.wait(&c.id, None).await,
        Err(StevedoreError::InvalidTransition { .. })
    ));

    runtime.start(&c.id).await.unwrap();
    assert!(matches!(
        runtime.start(&c.id).await,
        Err(StevedoreError::InvalidTransition { .. })
    ));
    with_timeout(runtime.wait(&c.id, None)).await.unwrap();
    runtime.delete(&c.id).await.unwrap();

    assert!(matches!(
        runtime.start("does-not-exist").await,
        Err(StevedoreError::ContainerNotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_creates_extract_the_image_once() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            runtime.create(shell("app:v1", "true")).await
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap().unwrap().id);
    }

    assert_eq!(images.extraction_count(), 1);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);
    assert_eq!(runtime.list().unwrap().len(), 6);
}

#[tokio::test]
async fn ports_are_allocated_exposed_and_released() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let mut spec = shell("app:v1", "echo port=$STEVEDORE_PORT_80");
    spec.ports = vec![PortRequest {
        container_port: 80,
        host_port: None,
    }];
    let c = runtime.create(spec).await.unwrap();
    assert_eq!(c.ports.len(), 1);
    let host_port = c.ports[0].host_port;
    assert!(host_port >= 49152);
    assert_eq!(runtime.reserved_ports(), 1);

    runtime.start(&c.id).await.unwrap();
    with_timeout(runtime.wait(&c.id, None)).await.unwrap();
    assert!(log_of(&runtime.get(&c.id).unwrap()).contains(&format!("port={host_port}")));

    runtime.delete(&c.id).await.unwrap();
    assert_eq!(runtime.reserved_ports(), 0);
}

#[tokio::test]
async fn unenforceable_limits_become_warnings() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let mut spec = shell("app:v1", "true");
    spec.limits = ResourceLimits {
        memory_bytes: Some(64 << 20),
        cpu_percent: Some(50),
    };
    let c = runtime.create(spec).await.unwrap();

    assert_eq!(c.status, ContainerStatus::Created);
    assert!(
        c.warnings.iter().any(|w| w.contains("cannot enforce")),
        "{:?}",
        c.warnings
    );
}

#[tokio::test]
async fn create_failures_leave_nothing_behind() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);

    assert!(matches!(
        runtime.create(shell("ghost:v1", "true")).await,
        Err(StevedoreError::ImageNotFound(_))
    ));

    images
        .import(&write_escaping_snapshot(dir.path()), "evil", "v1")
        .unwrap();
    assert!(matches!(
        runtime.create(shell("evil:v1", "true")).await,
        Err(StevedoreError::ExtractionFailed { .. })
    ));

    assert!(runtime.list().unwrap().is_empty());
    assert_eq!(std::fs::read_dir(store.rootfs_dir()).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(store.run_dir()).unwrap().count(), 0);
    assert!(!dir.path().join("escaped.txt").exists());
}

#[tokio::test]
async fn recover_marks_orphaned_running_containers_failed() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let c = runtime.create(shell("app:v1", "true")).await.unwrap();
    let mut orphan = c.clone();
    orphan.status = ContainerStatus::Running;
    store
        .write_record(RecordKind::Container, &c.id, &orphan)
        .unwrap();

    // A fresh runtime over the same store, as after a restart.
    let (_images, restarted) = host_runtime(&store);
    assert_eq!(restarted.recover().unwrap(), 1);

    let record = restarted.get(&c.id).unwrap();
    assert_eq!(record.status, ContainerStatus::Failed);
    assert!(!record.warnings.is_empty());
    assert!(restarted.delete(&c.id).await.unwrap().is_some());
}

#[tokio::test]
async fn container_executor_runs_workflow_tasks() {
    init_tracing();
    let (dir, store) = temp_store();
    let (images, runtime) = host_runtime(&store);
    images
        .import(&write_basic_snapshot(dir.path(), "app"), "app", "v1")
        .unwrap();

    let wf = WorkflowBuilder::new("pipeline")
        .with(
            TaskBuilder::new("prepare")
                .image("app:v1")
                .command(&["sh", "-c", "echo prepared"])
                .build(),
        )
        .with(
            TaskBuilder::new("broken")
                .image("app:v1")
                .after(&["prepare"])
                .command(&["sh", "-c", "echo oops >&2; exit 7"])
                .build(),
        )
        .with(
            TaskBuilder::new("hang")
                .image("app:v1")
                .command(&["sh", "-c", "sleep 30"])
                .timeout(Duration::from_millis(200))
                .build(),
        )
        .build();

    let executor = Arc::new(ContainerTaskExecutor::new(runtime.clone()));
    let engine = DagEngine::new(executor, store.clone(), EngineSettings::default());
    let execution = tokio::time::timeout(Duration::from_secs(20), engine.run(&wf, RunOptions::manual()))
        .await
        .expect("run finished")
        .unwrap()
        .into_execution()
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);

    let prepare = execution.task("prepare").unwrap();
    assert_eq!(prepare.state, TaskState::Succeeded);
    let log = store.log_path("pipeline", "prepare", &execution.id, 1);
    assert!(std::fs::read_to_string(log).unwrap().contains("prepared"));

    let broken = execution.task("broken").unwrap();
    assert_eq!(broken.state, TaskState::Failed);
    assert_eq!(broken.exit_code, Some(7));
    let kept = broken.container_id.as_deref().expect("failed container kept");
    let container = runtime.get(kept).unwrap();
    assert_eq!(container.status, ContainerStatus::Failed);
    assert_eq!(
        container.labels.get("stevedore.task").map(String::as_str),
        Some("broken")
    );

    let hang = execution.task("hang").unwrap();
    assert_eq!(hang.state, TaskState::Failed);
    assert!(hang.error.as_deref().unwrap().contains("timed out"));

    // Only failed attempts leave containers around.
    let remaining: BTreeMap<_, _> = runtime
        .list()
        .unwrap()
        .into_iter()
        .map(|c| (c.labels["stevedore.task"].clone(), c.status))
        .collect();
    assert_eq!(
        remaining,
        BTreeMap::from([
            ("broken".to_string(), ContainerStatus::Failed),
            ("hang".to_string(), ContainerStatus::Killed),
        ])
    );
}
