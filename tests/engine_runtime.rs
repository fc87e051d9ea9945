// tests/engine_runtime.rs

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use stevedore::dag::{load_history, DagEngine, EngineSettings};
use stevedore::engine::{
    CoreRuntime, RunRequest, Runtime, RuntimeEvent, RuntimeOptions, WorkflowLauncher,
};
use stevedore::types::{RunTrigger, TriggerWhileRunningBehaviour};
use stevedore_test_utils::builders::WorkflowBuilder;
use stevedore_test_utils::fake_executor::ScriptedExecutor;
use stevedore_test_utils::fake_launcher::RecordingLauncher;

use crate::common::{init_tracing, temp_store, with_timeout};

fn runtime(
    behaviour: TriggerWhileRunningBehaviour,
    queue_length: usize,
    exit_when_idle: bool,
    launcher: RecordingLauncher,
) -> (mpsc::Sender<RuntimeEvent>, Runtime<RecordingLauncher>) {
    let (tx, rx) = mpsc::channel(32);
    let core = CoreRuntime::new(behaviour, queue_length, RuntimeOptions { exit_when_idle });
    let rt = Runtime::new(core, tx.clone(), rx, Arc::new(launcher));
    (tx, rt)
}

fn workflows(launched: &[RunRequest]) -> Vec<&str> {
    launched.iter().map(|r| r.workflow.as_str()).collect()
}

#[tokio::test]
async fn busy_workflow_requests_are_queued_and_run_afterwards() {
    init_tracing();
    let launcher = RecordingLauncher::new(Duration::from_millis(50));
    let (tx, rt) = runtime(TriggerWhileRunningBehaviour::Queue, 1, true, launcher.clone());

    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("b"))).await.unwrap();

    with_timeout(rt.run()).await.unwrap();

    let launched = launcher.launched();
    assert_eq!(workflows(&launched), vec!["a", "b", "a"]);
    assert!(launcher.cancelled().is_empty());
}

#[tokio::test]
async fn queue_length_bounds_waiting_requests() {
    init_tracing();
    let launcher = RecordingLauncher::new(Duration::from_millis(50));
    let (tx, rt) = runtime(TriggerWhileRunningBehaviour::Queue, 1, true, launcher.clone());

    for _ in 0..4 {
        tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();
    }
    with_timeout(rt.run()).await.unwrap();

    assert_eq!(launcher.launched().len(), 2);
}

#[tokio::test]
async fn backfills_queue_in_logical_time_order_beyond_queue_length() {
    init_tracing();
    let launcher = RecordingLauncher::new(Duration::from_millis(10));
    let (tx, rt) = runtime(TriggerWhileRunningBehaviour::Queue, 1, true, launcher.clone());

    let hour = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();
    for h in [3, 1, 2, 1] {
        tx.send(RuntimeEvent::RunRequested(RunRequest::backfill("a", hour(h))))
            .await
            .unwrap();
    }
    with_timeout(rt.run()).await.unwrap();

    let launched = launcher.launched();
    assert_eq!(launched[0].trigger, RunTrigger::Manual);
    let times: Vec<_> = launched[1..].iter().map(|r| r.logical_time).collect();
    assert_eq!(times, vec![Some(hour(1)), Some(hour(2)), Some(hour(3))]);
}

#[tokio::test]
async fn cancel_mode_replaces_the_active_run() {
    init_tracing();
    let launcher = RecordingLauncher::new(Duration::from_millis(300));
    let (tx, rt) = runtime(TriggerWhileRunningBehaviour::Cancel, 1, true, launcher.clone());
    let handle = tokio::spawn(rt.run());

    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();

    with_timeout(handle).await.unwrap().unwrap();

    assert_eq!(launcher.launched().len(), 2);
    assert_eq!(launcher.cancelled().len(), 1);
}

#[tokio::test]
async fn shutdown_cancels_active_runs_and_exits() {
    init_tracing();
    let launcher = RecordingLauncher::new(Duration::from_secs(60));
    let (tx, rt) = runtime(TriggerWhileRunningBehaviour::Queue, 4, false, launcher.clone());
    let handle = tokio::spawn(rt.run());

    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("a"))).await.unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("b"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(RuntimeEvent::ShutdownRequested).await.unwrap();

    with_timeout(handle).await.unwrap().unwrap();

    // The queued second run of "a" is dropped, not started.
    assert_eq!(launcher.launched().len(), 2);
    assert_eq!(launcher.cancelled().len(), 2);
}

#[tokio::test]
async fn workflow_launcher_runs_configured_workflows() {
    init_tracing();
    let (_dir, store) = temp_store();

    let enabled = WorkflowBuilder::new("enabled").task("only", &[]).build();
    let mut disabled = WorkflowBuilder::new("disabled").task("only", &[]).build();
    disabled.enabled = false;
    let defs = BTreeMap::from([
        (enabled.name.clone(), enabled),
        (disabled.name.clone(), disabled),
    ]);

    let executor = Arc::new(ScriptedExecutor::new());
    let engine = Arc::new(DagEngine::new(
        Arc::clone(&executor),
        store.clone(),
        EngineSettings::default(),
    ));
    let launcher = Arc::new(WorkflowLauncher::new(engine, defs));

    let (tx, rx) = mpsc::channel(32);
    let core = CoreRuntime::new(
        TriggerWhileRunningBehaviour::Queue,
        1,
        RuntimeOptions { exit_when_idle: true },
    );
    let rt = Runtime::new(core, tx.clone(), rx, launcher);

    let t = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::scheduled("enabled", t))).await.unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::scheduled("disabled", t))).await.unwrap();
    tx.send(RuntimeEvent::RunRequested(RunRequest::manual("missing"))).await.unwrap();
    with_timeout(rt.run()).await.unwrap();

    let history = load_history(&store, "enabled").unwrap();
    let run = history.latest().expect("enabled workflow ran");
    assert_eq!(run.trigger, RunTrigger::Schedule);
    assert_eq!(run.logical_time, Some(t));

    assert!(load_history(&store, "disabled").unwrap().is_empty());
    assert_eq!(executor.attempts().len(), 1);
}
