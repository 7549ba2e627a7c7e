use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::TaskType;

pub const DEFAULT_CONFIG_FILE: &str = "decider.toml";

/// Long-poll window of the orchestration service; transport calls must be
/// allowed to outlast it.
pub const LONG_POLL_SECONDS: u64 = 60;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeciderConfig {
    pub workflow: WorkflowConfig,
    pub activities: ActivityConfig,
    pub execution: ExecutionConfig,
    pub transport: TransportConfig,
    pub fleet: FleetSettings,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WorkflowConfig {
    pub domain: String,
    /// Decision task list this process polls.
    pub task_list: String,
    pub identity: String,
}

/// Scheduling parameters shared by every `ScheduleActivityTask` decision.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ActivityConfig {
    /// Task list the divide/merge/build workers poll.
    pub task_list: String,
    pub version: String,
    pub divide_name: String,
    pub merge_name: String,
    pub build_name: String,
    pub schedule_to_close_timeout: String,
    pub schedule_to_start_timeout: String,
    pub start_to_close_timeout: String,
    pub heartbeat_timeout: String,
}

impl ActivityConfig {
    pub fn activity_name(&self, task_type: TaskType) -> &str {
        match task_type {
            TaskType::Divide => &self.divide_name,
            TaskType::Merge => &self.merge_name,
            TaskType::Build => &self.build_name,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Independent poll loops run concurrently.
    pub workers: u32,
    /// Stop after this many decision tasks in total. 0 means unlimited.
    pub max_decision_tasks: u32,
    pub error_backoff_seconds: u64,
    pub command_timeout_seconds: u64,
}

impl ExecutionConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub aws_binary: String,
    /// Empty means the command-line client's own default.
    pub region: String,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FleetSettings {
    /// Fleet configuration location: empty (hook disabled), a local JSON file,
    /// or an `s3://bucket/key` URI.
    pub config_source: String,
}

impl FleetSettings {
    pub fn is_enabled(&self) -> bool {
        !self.config_source.trim().is_empty()
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            domain: "default".to_string(),
            task_list: "decider".to_string(),
            identity: "divide-merge-decider".to_string(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            task_list: "worker".to_string(),
            version: "1".to_string(),
            divide_name: "divide".to_string(),
            merge_name: "merge".to_string(),
            build_name: "build".to_string(),
            schedule_to_close_timeout: "NONE".to_string(),
            schedule_to_start_timeout: "NONE".to_string(),
            start_to_close_timeout: "3600".to_string(),
            heartbeat_timeout: "NONE".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_decision_tasks: 0,
            error_backoff_seconds: 5,
            command_timeout_seconds: 90,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            aws_binary: "aws".to_string(),
            region: String::new(),
        }
    }
}

/// Default config file contents written by `init`.
pub fn default_config_toml() -> &'static str {
    r#"# divide-merge-decider configuration

[workflow]
# Orchestration domain and the decision task list this decider polls.
domain = "default"
task_list = "decider"
identity = "divide-merge-decider"

[activities]
# Task list the divide/merge/build workers poll.
task_list = "worker"
version = "1"
divide_name = "divide"
merge_name = "merge"
build_name = "build"
# Seconds as a decimal string, or "NONE".
schedule_to_close_timeout = "NONE"
schedule_to_start_timeout = "NONE"
start_to_close_timeout = "3600"
heartbeat_timeout = "NONE"

[execution]
workers = 1
# 0 = keep polling until interrupted.
max_decision_tasks = 0
error_backoff_seconds = 5
command_timeout_seconds = 90

[transport]
aws_binary = "aws"
region = ""

[fleet]
# Local JSON file or s3://bucket/key; empty disables scale-down on completion.
config_source = ""
"#
}

fn is_valid_timeout(value: &str) -> bool {
    value == "NONE" || (!value.is_empty() && value.chars().all(|c| c.is_ascii_digit()))
}

pub fn validate(config: &DeciderConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let required = [
        ("workflow.domain", &config.workflow.domain),
        ("workflow.task_list", &config.workflow.task_list),
        ("workflow.identity", &config.workflow.identity),
        ("activities.task_list", &config.activities.task_list),
        ("activities.version", &config.activities.version),
        ("activities.divide_name", &config.activities.divide_name),
        ("activities.merge_name", &config.activities.merge_name),
        ("activities.build_name", &config.activities.build_name),
        ("transport.aws_binary", &config.transport.aws_binary),
    ];
    for (key, value) in required {
        if value.trim().is_empty() {
            errors.push(format!("{} must not be empty", key));
        }
    }

    let names = [
        &config.activities.divide_name,
        &config.activities.merge_name,
        &config.activities.build_name,
    ];
    if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
        errors.push("activities: divide_name, merge_name and build_name must differ".to_string());
    }

    let timeouts = [
        (
            "activities.schedule_to_close_timeout",
            &config.activities.schedule_to_close_timeout,
        ),
        (
            "activities.schedule_to_start_timeout",
            &config.activities.schedule_to_start_timeout,
        ),
        (
            "activities.start_to_close_timeout",
            &config.activities.start_to_close_timeout,
        ),
        (
            "activities.heartbeat_timeout",
            &config.activities.heartbeat_timeout,
        ),
    ];
    for (key, value) in timeouts {
        if !is_valid_timeout(value) {
            errors.push(format!(
                "{}: '{}' must be a number of seconds or NONE",
                key, value
            ));
        }
    }

    if config.execution.workers < 1 {
        errors.push("execution.workers must be >= 1".to_string());
    }

    if config.execution.command_timeout_seconds <= LONG_POLL_SECONDS {
        errors.push(format!(
            "execution.command_timeout_seconds must be > {} (the long-poll window)",
            LONG_POLL_SECONDS
        ));
    }

    let source = config.fleet.config_source.trim();
    if let Some(rest) = source.strip_prefix("s3://") {
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {}
            _ => errors.push(format!(
                "fleet.config_source: '{}' must look like s3://bucket/key",
                source
            )),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Resolve the config path: explicit `--config`, else `decider.toml` in `root`.
pub fn resolve_config_path(config_path: Option<&Path>, root: &Path) -> PathBuf {
    match config_path {
        Some(p) => p.to_path_buf(),
        None => root.join(DEFAULT_CONFIG_FILE),
    }
}

/// Load and validate configuration. A missing default file yields defaults;
/// a missing explicit file is an error.
pub fn load_config_from(config_path: Option<&Path>, root: &Path) -> Result<DeciderConfig, String> {
    let path = resolve_config_path(config_path, root);

    if !path.exists() {
        if config_path.is_some() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(DeciderConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let config: DeciderConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

pub fn load_config(root: &Path) -> Result<DeciderConfig, String> {
    load_config_from(None, root)
}
