// tests/config_loading.rs

mod common;

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use stevedore::config::{load_and_validate, parse_str, ConfigFile};
use stevedore::container::PortRequest;
use stevedore::errors::StevedoreError;
use stevedore::types::{BackoffKind, RestartPolicy, TriggerWhileRunningBehaviour};
use stevedore_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder, WorkflowConfigBuilder};

fn load(toml: &str) -> Result<ConfigFile, StevedoreError> {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{toml}").unwrap();
    load_and_validate(file.path())
}

#[test]
fn full_document_is_validated_into_engine_types() {
    let cfg = load(
        r#"
[config]
parallelism = 2
history_limit = 10
backoff = "fixed"
max_retry_delay = "1m"
triggered_while_running_behaviour = "cancel"
max_backfill_runs = 200

[service.db]
image = "postgres:16"
ports = ["5432", "15432:5433"]
memory_limit = "256m"
restart_policy = "on-failure"

[workflow.etl]
schedule = "0 2 * * *"
description = "nightly load"

[[workflow.etl.task]]
name = "extract"
image = "etl:latest"
command = "python extract.py"
timeout = "10m"

[[workflow.etl.task]]
name = "transform"
image = "etl:latest"
command = ["python", "transform.py"]
depends_on = ["extract"]
retries = 2
retry_delay = "30s"
sla = "1h"
on_failure = "page-oncall"
cpu_limit = 50
"#,
    )
    .expect("valid config");

    let s = &cfg.settings;
    assert_eq!(s.parallelism, 2);
    assert_eq!(s.history_limit, 10);
    assert_eq!(s.backoff.kind, BackoffKind::Fixed);
    assert_eq!(s.backoff.max_delay, Duration::from_secs(60));
    assert_eq!(s.max_backfill_runs, 200);
    assert_eq!(
        s.triggered_while_running_behaviour,
        TriggerWhileRunningBehaviour::Cancel
    );

    let db = &cfg.services["db"];
    assert_eq!(db.command, vec!["./run"]);
    assert_eq!(db.restart_policy, RestartPolicy::OnFailure);
    assert_eq!(db.limits.memory_bytes, Some(256 * 1024 * 1024));
    assert_eq!(
        db.ports,
        vec![
            PortRequest { container_port: 5432, host_port: None },
            PortRequest { container_port: 5433, host_port: Some(15432) },
        ]
    );

    let etl = cfg.workflow("etl").expect("etl workflow");
    assert_eq!(etl.schedule.as_deref(), Some("0 2 * * *"));
    let extract = etl.task("extract").unwrap();
    assert_eq!(extract.command, vec!["sh", "-c", "python extract.py"]);
    assert_eq!(extract.timeout, Some(Duration::from_secs(600)));
    assert_eq!(extract.retry_delay, Duration::from_secs(300));

    let transform = etl.task("transform").unwrap();
    assert_eq!(transform.command, vec!["python", "transform.py"]);
    assert_eq!(transform.max_attempts(), 3);
    assert_eq!(transform.retry_delay, Duration::from_secs(30));
    assert_eq!(transform.sla, Some(Duration::from_secs(3600)));
    assert_eq!(transform.on_failure.as_deref(), Some("page-oncall"));
    assert_eq!(transform.limits.cpu_percent, Some(50));
}

#[test]
fn relative_state_dir_is_resolved_next_to_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Stevedore.toml");
    std::fs::write(
        &path,
        r#"
[[workflow.hello.task]]
name = "say"
image = "busybox"
command = "echo hi"
"#,
    )
    .unwrap();

    let cfg = load_and_validate(&path).unwrap();
    assert_eq!(cfg.settings.state_dir, dir.path().join(".stevedore"));
}

#[test]
fn unknown_dependency_returns_structured_error() {
    let result = load(
        r#"
[[workflow.wf.task]]
name = "a"
image = "busybox"
command = "true"
depends_on = ["missing"]
"#,
    );

    match result {
        Err(StevedoreError::UnknownDependency { task, dependency }) => {
            assert_eq!(task, "a");
            assert_eq!(dependency, "missing");
        }
        other => panic!("Expected UnknownDependency, got: {other:?}"),
    }
}

#[test]
fn cycle_returns_structured_error() {
    let result = load(
        r#"
[[workflow.wf.task]]
name = "a"
image = "busybox"
command = "true"
depends_on = ["b"]

[[workflow.wf.task]]
name = "b"
image = "busybox"
command = "true"
depends_on = ["a"]
"#,
    );

    match result {
        Err(StevedoreError::CycleDetected { tasks }) => {
            assert!(tasks.contains(&"a".to_string()));
            assert!(tasks.contains(&"b".to_string()));
        }
        other => panic!("Expected CycleDetected, got: {other:?}"),
    }
}

#[test]
fn forward_references_are_allowed() {
    let cfg = ConfigFileBuilder::new()
        .with_workflow(
            "wf",
            WorkflowConfigBuilder::new()
                .with_task(TaskConfigBuilder::new("load", "true").after("extract").build())
                .with_task(TaskConfigBuilder::new("extract", "true").build())
                .build(),
        )
        .build();

    let wf = cfg.workflow("wf").unwrap();
    assert_eq!(wf.task_names().collect::<Vec<_>>(), vec!["load", "extract"]);
}

#[test]
fn invalid_cron_is_rejected() {
    let raw = ConfigFileBuilder::new()
        .with_workflow(
            "wf",
            WorkflowConfigBuilder::new()
                .schedule("61 * * * *")
                .with_task(TaskConfigBuilder::new("a", "true").build())
                .build(),
        )
        .raw();

    match ConfigFile::try_from(raw) {
        Err(StevedoreError::InvalidCron { expr, .. }) => assert_eq!(expr, "61 * * * *"),
        other => panic!("Expected InvalidCron, got: {other:?}"),
    }
}

#[test]
fn names_that_are_not_path_safe_are_rejected() {
    for bad in ["../escape", "has space", "", "-leading-dash"] {
        let raw = ConfigFileBuilder::new()
            .with_workflow(
                "wf",
                WorkflowConfigBuilder::new()
                    .with_task(TaskConfigBuilder::new(bad, "true").build())
                    .build(),
            )
            .raw();
        assert!(
            matches!(ConfigFile::try_from(raw), Err(StevedoreError::ConfigError(_))),
            "task name {bad:?} should be rejected"
        );
    }
}

#[test]
fn out_of_range_values_are_config_errors() {
    let cases = [
        "[config]\nparallelism = 0\n",
        "[config]\nqueue_length = 0\n",
        "[config]\nmax_backfill_runs = 0\n",
        "[config]\nport_range = [9000, 8000]\n",
        "[config]\ntick_interval = \"5 fortnights\"\n",
        "[[workflow.wf.task]]\nname = \"a\"\nimage = \"x\"\ncommand = \"true\"\ncpu_limit = 150\n",
        "[[workflow.wf.task]]\nname = \"a\"\nimage = \"x\"\ncommand = \"true\"\ntimeout = \"0s\"\n",
        "[[workflow.wf.task]]\nname = \"a\"\nimage = \"\"\ncommand = \"true\"\n",
        "[[workflow.wf.task]]\nname = \"a\"\nimage = \"x\"\ncommand = []\n",
        "[workflow.empty]\n",
    ];
    for doc in cases {
        let raw = parse_str(doc).unwrap_or_else(|e| panic!("{doc:?} should parse: {e}"));
        assert!(
            matches!(ConfigFile::try_from(raw), Err(StevedoreError::ConfigError(_))),
            "{doc:?} should fail validation"
        );
    }
}

#[test]
fn unknown_fields_are_toml_errors() {
    let result = load("[config]\nparalelism = 3\n");
    assert!(matches!(result, Err(StevedoreError::TomlError(_))), "{result:?}");
}
