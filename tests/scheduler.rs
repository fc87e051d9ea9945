// tests/scheduler.rs

mod common;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::mpsc;

use stevedore::cancel::CancelToken;
use stevedore::engine::{RunRequest, RuntimeEvent};
use stevedore::errors::StevedoreError;
use stevedore::scheduler::{
    ClaimedSpan, ClaimedTimes, JobRegistry, ScheduledJob, Scheduler, SchedulerDaemon,
    SchedulerRegistry,
};
use stevedore::store::RecordKind;
use stevedore::types::RunTrigger;

use crate::common::{init_tracing, temp_store, with_timeout};

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
}

fn drain(rx: &mut mpsc::Receiver<RuntimeEvent>) -> Vec<RunRequest> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RuntimeEvent::RunRequested(req) = event {
            out.push(req);
        }
    }
    out
}

#[tokio::test]
async fn tick_fires_due_jobs_and_advances_them() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);

    let job = scheduler
        .registry()
        .schedule("etl", "*/5 * * * *", at(0, 0))
        .unwrap();
    assert_eq!(job.next_fire_time, Some(at(0, 5)));

    assert_eq!(scheduler.tick(at(0, 4)).await.unwrap(), 0);
    assert_eq!(scheduler.tick(at(0, 5)).await.unwrap(), 1);
    // Same instant again: already advanced, nothing new.
    assert_eq!(scheduler.tick(at(0, 5)).await.unwrap(), 0);

    let requests = drain(&mut rx);
    assert_eq!(requests, vec![RunRequest::scheduled("etl", at(0, 5))]);
    assert_eq!(requests[0].trigger, RunTrigger::Schedule);

    let job = scheduler.registry().job("etl").unwrap().unwrap();
    assert_eq!(job.last_fired_time, Some(at(0, 5)));
    assert_eq!(job.next_fire_time, Some(at(0, 10)));
}

#[tokio::test]
async fn long_outage_fires_only_the_latest_missed_occurrence() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);
    scheduler
        .registry()
        .schedule("etl", "*/5 * * * *", at(0, 0))
        .unwrap();

    assert_eq!(scheduler.tick(at(1, 2)).await.unwrap(), 1);
    assert_eq!(drain(&mut rx), vec![RunRequest::scheduled("etl", at(1, 0))]);

    let job = scheduler.registry().job("etl").unwrap().unwrap();
    assert_eq!(job.next_fire_time, Some(at(1, 5)));
}

#[tokio::test]
async fn fire_is_persisted_before_the_request_is_sent() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);
    scheduler
        .registry()
        .schedule("etl", "@hourly", at(0, 30))
        .unwrap();

    // Nobody is listening: the send fails after the claim was written.
    drop(rx);
    assert!(scheduler.tick(at(1, 0)).await.is_err());

    let job = scheduler.registry().job("etl").unwrap().unwrap();
    assert_eq!(job.last_fired_time, Some(at(1, 0)));
    assert_eq!(job.next_fire_time, Some(at(2, 0)));
}

#[tokio::test]
async fn unwritable_registry_sends_nothing() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store.clone(), tx);
    scheduler
        .registry()
        .schedule("etl", "*/5 * * * *", at(0, 0))
        .unwrap();

    let path = store.record_path(RecordKind::Scheduler, "registry");
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    match scheduler.tick(at(0, 5)).await {
        Err(StevedoreError::SchedulerPersistenceError(_)) => {}
        other => panic!("expected persistence error, got {other:?}"),
    }
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn paused_jobs_keep_their_next_fire_time() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);
    let registry = scheduler.registry();
    registry.schedule("etl", "*/5 * * * *", at(0, 0)).unwrap();

    let paused = registry.pause("etl").unwrap();
    assert!(!paused.enabled);
    assert_eq!(scheduler.tick(at(0, 7)).await.unwrap(), 0);
    assert_eq!(
        registry.job("etl").unwrap().unwrap().next_fire_time,
        Some(at(0, 5))
    );

    registry.resume("etl").unwrap();
    assert_eq!(scheduler.tick(at(0, 7)).await.unwrap(), 1);
    assert_eq!(drain(&mut rx), vec![RunRequest::scheduled("etl", at(0, 5))]);

    assert!(matches!(
        registry.pause("missing"),
        Err(StevedoreError::WorkflowNotFound(_))
    ));
    assert!(registry.unschedule("etl").unwrap());
    assert!(!registry.unschedule("etl").unwrap());
}

#[tokio::test]
async fn rescheduling_with_the_same_expression_keeps_state() {
    let (_dir, store) = temp_store();
    let (tx, _rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);
    let registry = scheduler.registry();

    registry.schedule("etl", "0 * * * *", at(0, 10)).unwrap();
    registry.pause("etl").unwrap();
    let again = registry.schedule("etl", "0 * * * *", at(5, 10)).unwrap();
    assert!(!again.enabled);
    assert_eq!(again.next_fire_time, Some(at(1, 0)));

    let changed = registry.schedule("etl", "30 * * * *", at(5, 10)).unwrap();
    assert_eq!(changed.next_fire_time, Some(at(5, 30)));
}

#[tokio::test]
async fn backfill_is_idempotent_and_ordered() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = Scheduler::new(store, tx);
    scheduler
        .registry()
        .schedule("etl", "0 * * * *", at(12, 0))
        .unwrap();

    let first = scheduler.backfill("etl", at(1, 0), at(3, 0)).await.unwrap();
    assert_eq!(first, vec![at(1, 0), at(2, 0), at(3, 0)]);

    let again = scheduler.backfill("etl", at(1, 0), at(3, 0)).await.unwrap();
    assert!(again.is_empty());

    let wider = scheduler.backfill("etl", at(0, 0), at(4, 30)).await.unwrap();
    assert_eq!(wider, vec![at(0, 0), at(4, 0)]);

    let requests = drain(&mut rx);
    assert_eq!(requests.len(), 5);
    assert!(requests.iter().all(|r| r.trigger == RunTrigger::Backfill));
    assert_eq!(requests[0], RunRequest::backfill("etl", at(1, 0)));

    // Five consecutive hours are stored as a single span.
    let job = scheduler.registry().job("etl").unwrap().unwrap();
    assert_eq!(
        job.claimed.spans(),
        &[ClaimedSpan {
            first: at(0, 0),
            last: at(4, 0)
        }]
    );
}

#[tokio::test]
async fn backfill_skips_the_occurrence_already_fired_by_the_tick() {
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = Scheduler::new(store, tx);
    scheduler
        .registry()
        .schedule("etl", "0 * * * *", at(0, 30))
        .unwrap();
    scheduler.tick(at(1, 0)).await.unwrap();
    drain(&mut rx);

    let enqueued = scheduler.backfill("etl", at(0, 0), at(2, 0)).await.unwrap();
    assert_eq!(enqueued, vec![at(0, 0), at(2, 0)]);
}

#[tokio::test]
async fn backfill_skips_every_hour_the_tick_fired() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = Scheduler::new(store, tx);
    scheduler
        .registry()
        .schedule("etl", "0 * * * *", at(0, 30))
        .unwrap();

    assert_eq!(scheduler.tick(at(1, 0)).await.unwrap(), 1);
    assert_eq!(scheduler.tick(at(2, 0)).await.unwrap(), 1);
    assert_eq!(drain(&mut rx).len(), 2);

    let enqueued = scheduler.backfill("etl", at(0, 0), at(2, 0)).await.unwrap();
    assert_eq!(enqueued, vec![at(0, 0)]);
    assert_eq!(drain(&mut rx), vec![RunRequest::backfill("etl", at(0, 0))]);
}

#[tokio::test]
async fn backfill_fills_the_gap_left_by_an_outage() {
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = Scheduler::new(store, tx);
    scheduler
        .registry()
        .schedule("etl", "0 * * * *", at(0, 30))
        .unwrap();

    scheduler.tick(at(1, 0)).await.unwrap();
    // Down from 01:00 to 05:10: only 05:00 fires.
    scheduler.tick(at(5, 10)).await.unwrap();
    drain(&mut rx);
    let job = scheduler.registry().job("etl").unwrap().unwrap();
    assert_eq!(job.claimed.spans().len(), 2);

    let enqueued = scheduler.backfill("etl", at(1, 0), at(5, 0)).await.unwrap();
    assert_eq!(enqueued, vec![at(2, 0), at(3, 0), at(4, 0)]);

    let job = scheduler.registry().job("etl").unwrap().unwrap();
    assert_eq!(
        job.claimed.spans(),
        &[ClaimedSpan {
            first: at(1, 0),
            last: at(5, 0)
        }]
    );
}

#[tokio::test]
async fn oversized_backfill_window_is_rejected_without_claiming() {
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = Scheduler::new(store, tx).with_max_backfill_runs(10);
    scheduler
        .registry()
        .schedule("etl", "* * * * *", at(12, 0))
        .unwrap();

    // 00:00..=00:10 holds eleven occurrences.
    match scheduler.backfill("etl", at(0, 0), at(0, 10)).await {
        Err(StevedoreError::ConfigError(msg)) => assert!(msg.contains("more than 10")),
        other => panic!("expected ConfigError, got {other:?}"),
    }
    assert!(drain(&mut rx).is_empty());
    let job = scheduler.registry().job("etl").unwrap().unwrap();
    assert!(job.claimed.spans().is_empty());

    let enqueued = scheduler.backfill("etl", at(0, 0), at(0, 9)).await.unwrap();
    assert_eq!(enqueued.len(), 10);
}

#[tokio::test]
async fn invalid_stored_cron_does_not_stop_other_jobs() {
    init_tracing();
    let (_dir, store) = temp_store();

    let job = |workflow: &str, cron: &str| ScheduledJob {
        workflow: workflow.to_string(),
        cron: cron.to_string(),
        enabled: true,
        next_fire_time: Some(at(1, 0)),
        last_fired_time: None,
        claimed: ClaimedTimes::default(),
    };
    let registry = SchedulerRegistry {
        jobs: BTreeMap::from([
            ("broken".to_string(), job("broken", "not a cron")),
            ("etl".to_string(), job("etl", "0 * * * *")),
        ]),
    };
    store
        .write_record(RecordKind::Scheduler, "registry", &registry)
        .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);
    assert_eq!(scheduler.tick(at(1, 0)).await.unwrap(), 1);
    assert_eq!(drain(&mut rx), vec![RunRequest::scheduled("etl", at(1, 0))]);

    // The broken job is left untouched for an operator to fix.
    let broken = scheduler.registry().job("broken").unwrap().unwrap();
    assert_eq!(broken.last_fired_time, None);
    assert_eq!(broken.next_fire_time, Some(at(1, 0)));
}

#[tokio::test]
async fn backfill_rejects_bad_windows_and_unknown_workflows() {
    let (_dir, store) = temp_store();
    let (tx, _rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);
    scheduler
        .registry()
        .schedule("etl", "0 * * * *", at(0, 0))
        .unwrap();

    assert!(matches!(
        scheduler.backfill("etl", at(3, 0), at(1, 0)).await,
        Err(StevedoreError::ConfigError(_))
    ));
    assert!(matches!(
        scheduler.backfill("nope", at(1, 0), at(3, 0)).await,
        Err(StevedoreError::WorkflowNotFound(_))
    ));
}

#[test]
fn load_repairs_a_fire_that_was_recorded_but_not_advanced() {
    init_tracing();
    let (_dir, store) = temp_store();

    // State after a crash between recording the fire and advancing.
    let job = ScheduledJob {
        workflow: "etl".to_string(),
        cron: "*/5 * * * *".to_string(),
        enabled: true,
        next_fire_time: Some(at(0, 5)),
        last_fired_time: Some(at(0, 5)),
        claimed: ClaimedTimes::default(),
    };
    let registry = SchedulerRegistry {
        jobs: BTreeMap::from([("etl".to_string(), job)]),
    };
    store
        .write_record(RecordKind::Scheduler, "registry", &registry)
        .unwrap();

    let (tx, _rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store, tx);
    let repaired = scheduler.registry().load().unwrap();
    assert_eq!(repaired.jobs["etl"].next_fire_time, Some(at(0, 10)));

    // The repaired job does not fire the recorded occurrence twice.
    let due_again = at(0, 5) + Duration::seconds(30);
    assert!(!repaired.jobs["etl"].is_due(due_again));
}

#[tokio::test]
async fn trigger_now_enqueues_a_manual_run() {
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(4);
    let scheduler = Scheduler::new(store, tx);

    scheduler.trigger_now("etl").await.unwrap();
    let requests = drain(&mut rx);
    assert_eq!(requests, vec![RunRequest::manual("etl")]);
    assert_eq!(requests[0].logical_time, None);
}

#[tokio::test]
async fn daemon_ticks_until_shutdown() {
    init_tracing();
    let (_dir, store) = temp_store();
    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = Scheduler::new(store.clone(), tx);
    let registry = scheduler.registry();
    registry
        .schedule("etl", "* * * * *", Utc::now() - Duration::minutes(2))
        .unwrap();
    registry
        .schedule("paused", "* * * * *", Utc::now() - Duration::minutes(2))
        .unwrap();
    registry.pause("paused").unwrap();

    let shutdown = CancelToken::new();
    let handle = SchedulerDaemon::spawn(
        scheduler,
        std::time::Duration::from_millis(20),
        shutdown.clone(),
    );

    let event = with_timeout(rx.recv()).await.expect("a fire");
    let RuntimeEvent::RunRequested(request) = event else {
        panic!("expected a run request");
    };
    assert_eq!(request.workflow, "etl");
    assert_eq!(request.trigger, RunTrigger::Schedule);

    shutdown.cancel();
    with_timeout(handle).await.unwrap();

    let persisted: Vec<_> = JobRegistry::new(store)
        .jobs()
        .unwrap()
        .into_iter()
        .map(|j| (j.workflow, j.last_fired_time.is_some()))
        .collect();
    assert_eq!(
        persisted,
        vec![("etl".to_string(), true), ("paused".to_string(), false)]
    );
}
