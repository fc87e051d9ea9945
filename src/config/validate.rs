// src/config/validate.rs

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::model::{
    ConfigFile, ConfigSection, DEFAULT_SERVICE_COMMAND, RawConfigFile, RawServiceConfig,
    RawTaskConfig, RawWorkflowConfig, ServiceSpec, Settings,
};
use crate::config::units::{parse_duration, parse_memory, parse_port, parse_volume};
use crate::container::ResourceLimits;
use crate::dag::graph::validate as validate_dag;
use crate::dag::retry::BackoffPolicy;
use crate::dag::workflow::{DEFAULT_RETRY_DELAY, Task, Workflow};
use crate::errors::{Result, StevedoreError};
use crate::scheduler::cron::CronSchedule;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = StevedoreError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let settings = validate_settings(&raw.config)?;

        let mut services = BTreeMap::new();
        for (name, svc) in raw.service {
            let spec = validate_service(&name, svc)?;
            services.insert(name, spec);
        }

        let mut workflows = BTreeMap::new();
        for (name, wf) in raw.workflow {
            let workflow = validate_workflow(&name, wf)?;
            workflows.insert(name, workflow);
        }

        Ok(ConfigFile {
            settings,
            services,
            workflows,
        })
    }
}

/// Workflow, task and service names become file and directory names.
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("name pattern is valid")
});

fn config_err(msg: impl Into<String>) -> StevedoreError {
    StevedoreError::ConfigError(msg.into())
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(config_err(format!(
            "invalid {what} name '{name}': use letters, digits, '_', '.' or '-', starting with a letter or digit"
        )))
    }
}

fn duration_field(section: &str, field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_err(format!("{section}.{field}: {e}")))
}

fn validate_settings(cfg: &ConfigSection) -> Result<Settings> {
    if cfg.queue_length == 0 {
        return Err(config_err("[config].queue_length must be >= 1 (got 0)"));
    }
    if cfg.history_limit == 0 {
        return Err(config_err("[config].history_limit must be >= 1 (got 0)"));
    }
    if cfg.max_backfill_runs == 0 {
        return Err(config_err("[config].max_backfill_runs must be >= 1 (got 0)"));
    }
    if cfg.port_attempts == 0 {
        return Err(config_err("[config].port_attempts must be >= 1 (got 0)"));
    }
    let [lo, hi] = cfg.port_range;
    if lo == 0 || lo > hi {
        return Err(config_err(format!(
            "[config].port_range must be a non-empty range of non-zero ports (got [{lo}, {hi}])"
        )));
    }

    let parallelism = match cfg.parallelism {
        Some(0) => return Err(config_err("[config].parallelism must be >= 1 (got 0)")),
        Some(n) => n,
        None => std::thread::available_parallelism().map_or(1, |n| n.get()),
    };

    let tick_interval = duration_field("[config]", "tick_interval", &cfg.tick_interval)?;
    if tick_interval.is_zero() {
        return Err(config_err("[config].tick_interval must be greater than zero"));
    }

    Ok(Settings {
        state_dir: cfg.state_dir.clone(),
        parallelism,
        history_limit: cfg.history_limit,
        tick_interval,
        backoff: BackoffPolicy {
            kind: cfg.backoff,
            max_delay: duration_field("[config]", "max_retry_delay", &cfg.max_retry_delay)?,
        },
        port_range: (lo, hi),
        port_attempts: cfg.port_attempts,
        triggered_while_running_behaviour: cfg.triggered_while_running_behaviour,
        queue_length: cfg.queue_length,
        image_retention: duration_field("[config]", "image_retention", &cfg.image_retention)?,
        keep_last_images: cfg.keep_last_images,
        log_retention: duration_field("[config]", "log_retention", &cfg.log_retention)?,
        max_backfill_runs: cfg.max_backfill_runs,
        isolation: cfg.isolation,
    })
}

fn limits(section: &str, memory: Option<&str>, cpu: Option<u32>) -> Result<ResourceLimits> {
    let memory_bytes = memory
        .map(|m| parse_memory(m).map_err(|e| config_err(format!("{section}.memory_limit: {e}"))))
        .transpose()?;
    if let Some(cpu) = cpu {
        if !(1..=100).contains(&cpu) {
            return Err(config_err(format!(
                "{section}.cpu_limit must be between 1 and 100 (got {cpu})"
            )));
        }
    }
    Ok(ResourceLimits {
        memory_bytes,
        cpu_percent: cpu,
    })
}

fn validate_command(section: &str, argv: Vec<String>) -> Result<Vec<String>> {
    if argv.first().is_none_or(|p| p.trim().is_empty()) {
        return Err(config_err(format!("{section}.command must not be empty")));
    }
    Ok(argv)
}

fn validate_service(name: &str, svc: RawServiceConfig) -> Result<ServiceSpec> {
    check_name("service", name)?;
    let section = format!("[service.{name}]");
    if svc.image.trim().is_empty() {
        return Err(config_err(format!("{section}.image must not be empty")));
    }

    let command = match svc.command {
        Some(cmd) => validate_command(&section, cmd.into_argv())?,
        None => vec![DEFAULT_SERVICE_COMMAND.to_string()],
    };
    let ports = svc
        .ports
        .iter()
        .map(|p| parse_port(p).map_err(|e| config_err(format!("{section}.ports: {e}"))))
        .collect::<Result<Vec<_>>>()?;
    let volumes = svc
        .volumes
        .iter()
        .map(|v| parse_volume(v).map_err(|e| config_err(format!("{section}.volumes: {e}"))))
        .collect::<Result<Vec<_>>>()?;

    Ok(ServiceSpec {
        name: name.to_string(),
        image: svc.image,
        command,
        ports,
        env: svc.env,
        volumes,
        limits: limits(&section, svc.memory_limit.as_deref(), svc.cpu_limit)?,
        restart_policy: svc.restart_policy,
    })
}

fn validate_task(workflow: &str, raw: RawTaskConfig) -> Result<Task> {
    let section = format!("[workflow.{workflow}] task '{}'", raw.name);
    if raw.name.trim().is_empty() {
        return Err(config_err(format!(
            "[workflow.{workflow}] has a task with an empty name"
        )));
    }
    check_name("task", &raw.name)?;
    if raw.image.trim().is_empty() {
        return Err(config_err(format!("{section}: image must not be empty")));
    }

    let timeout = raw
        .timeout
        .as_deref()
        .map(|t| duration_field(&section, "timeout", t))
        .transpose()?;
    if timeout.is_some_and(|t| t.is_zero()) {
        return Err(config_err(format!("{section}: timeout must be greater than zero")));
    }

    Ok(Task {
        name: raw.name.clone(),
        image: raw.image,
        command: validate_command(&section, raw.command.into_argv())?,
        depends_on: raw.depends_on,
        retries: raw.retries,
        retry_delay: raw
            .retry_delay
            .as_deref()
            .map(|d| duration_field(&section, "retry_delay", d))
            .transpose()?
            .unwrap_or(DEFAULT_RETRY_DELAY),
        timeout,
        sla: raw
            .sla
            .as_deref()
            .map(|d| duration_field(&section, "sla", d))
            .transpose()?,
        on_failure: raw.on_failure,
        env: raw.env,
        limits: limits(&section, raw.memory_limit.as_deref(), raw.cpu_limit)?,
    })
}

fn validate_workflow(name: &str, raw: RawWorkflowConfig) -> Result<Workflow> {
    check_name("workflow", name)?;
    if raw.task.is_empty() {
        return Err(config_err(format!(
            "[workflow.{name}] must contain at least one [[workflow.{name}.task]]"
        )));
    }
    if let Some(expr) = raw.schedule.as_deref() {
        CronSchedule::from_str(expr)?;
    }

    let tasks = raw
        .task
        .into_iter()
        .map(|t| validate_task(name, t))
        .collect::<Result<Vec<_>>>()?;

    let workflow = Workflow {
        name: name.to_string(),
        tasks,
        schedule: raw.schedule,
        description: raw.description,
        enabled: raw.enabled,
    };
    validate_dag(&workflow)?;
    Ok(workflow)
}
