use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DeciderConfig, TransportConfig};
use crate::error::DeciderError;
use crate::process::run_command;
use crate::{log_info, log_warn};

/// Fleet configuration blob. Other keys may be present and are ignored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    #[serde(default)]
    pub automatically_take_down: bool,
    #[serde(default)]
    pub auto_scaling_group_name: String,
}

/// Where the fleet configuration lives.
#[derive(Clone, Debug, PartialEq)]
pub enum FleetConfigSource {
    File(PathBuf),
    S3 { uri: String },
}

impl FleetConfigSource {
    /// `None` when the source is empty (hook disabled).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else if raw.starts_with("s3://") {
            Some(FleetConfigSource::S3 {
                uri: raw.to_string(),
            })
        } else {
            Some(FleetConfigSource::File(PathBuf::from(raw)))
        }
    }
}

/// What the completion hook did.
#[derive(Debug, Clone, PartialEq)]
pub enum TakeDownOutcome {
    /// No fleet configuration exists.
    NotConfigured,
    /// Configuration says to leave the fleet running.
    Disabled,
    ScaledDown(String),
    /// Logged and swallowed.
    Failed(String),
}

/// Completion-time collaborator: fleet configuration lookup and scale-to-zero.
pub trait FleetHook: Send + Sync {
    fn load_fleet_config(
        &self,
    ) -> impl Future<Output = Result<Option<FleetConfig>, DeciderError>> + Send;

    fn scale_to_zero(
        &self,
        auto_scaling_group_name: &str,
    ) -> impl Future<Output = Result<(), DeciderError>> + Send;
}

/// Run the completion hook. Never fails: the terminal decision has already
/// been decided and nothing here may block it.
pub async fn take_down_fleet<H: FleetHook>(hook: &H) -> TakeDownOutcome {
    let config = match hook.load_fleet_config().await {
        Ok(Some(config)) => config,
        Ok(None) => {
            log_info!("[fleet] No fleet configuration; leaving fleet as is");
            return TakeDownOutcome::NotConfigured;
        }
        Err(e) => {
            log_warn!("[fleet] Could not load fleet configuration: {}", e);
            return TakeDownOutcome::Failed(e.to_string());
        }
    };

    if !config.automatically_take_down {
        log_info!("[fleet] automaticallyTakeDown is off; leaving fleet running");
        return TakeDownOutcome::Disabled;
    }

    let group = config.auto_scaling_group_name.trim();
    if group.is_empty() {
        log_warn!("[fleet] automaticallyTakeDown is on but autoScalingGroupName is empty");
        return TakeDownOutcome::Failed("autoScalingGroupName is empty".to_string());
    }

    match hook.scale_to_zero(group).await {
        Ok(()) => {
            log_info!("[fleet] Scaled auto-scaling group {} to zero", group);
            TakeDownOutcome::ScaledDown(group.to_string())
        }
        Err(e) => {
            log_warn!("[fleet] Scale-down of {} rejected: {}", group, e);
            TakeDownOutcome::Failed(e.to_string())
        }
    }
}

/// Real hook backed by the command-line client.
pub struct CliFleetHook {
    source: Option<FleetConfigSource>,
    transport: TransportConfig,
    timeout: Duration,
}

impl CliFleetHook {
    pub fn new(
        source: Option<FleetConfigSource>,
        transport: TransportConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            transport,
            timeout,
        }
    }

    pub fn from_config(config: &DeciderConfig) -> Self {
        Self::new(
            FleetConfigSource::parse(&config.fleet.config_source),
            config.transport.clone(),
            config.execution.command_timeout(),
        )
    }

    fn command(&self, args: &[&str]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.transport.aws_binary);
        cmd.args(args);
        if !self.transport.region.is_empty() {
            cmd.args(["--region", self.transport.region.as_str()]);
        }
        cmd.args(["--output", "json"]);
        cmd
    }
}

pub fn parse_fleet_config(contents: &str) -> Result<FleetConfig, DeciderError> {
    serde_json::from_str(contents)
        .map_err(|e| DeciderError::Fleet(format!("Invalid fleet configuration: {}", e)))
}

impl FleetHook for CliFleetHook {
    async fn load_fleet_config(&self) -> Result<Option<FleetConfig>, DeciderError> {
        let contents = match &self.source {
            None => return Ok(None),
            Some(FleetConfigSource::File(path)) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(DeciderError::Fleet(format!(
                        "Failed to read {}: {}",
                        path.display(),
                        e
                    )))
                }
            },
            Some(FleetConfigSource::S3 { uri }) => {
                run_command(self.command(&["s3", "cp", uri.as_str(), "-"]), self.timeout)
                    .await
                    .map_err(|e| DeciderError::Fleet(format!("Failed to fetch {}: {}", uri, e)))?
            }
        };
        parse_fleet_config(&contents).map(Some)
    }

    async fn scale_to_zero(&self, auto_scaling_group_name: &str) -> Result<(), DeciderError> {
        let cmd = self.command(&[
            "autoscaling",
            "update-auto-scaling-group",
            "--auto-scaling-group-name",
            auto_scaling_group_name,
            "--min-size",
            "0",
            "--max-size",
            "0",
            "--desired-capacity",
            "0",
        ]);
        run_command(cmd, self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| DeciderError::Fleet(e.to_string()))
    }
}

/// Mock hook for loop tests.
///
/// Returns a fixed configuration (or error) and records every scale-down request.
pub struct MockFleetHook {
    config: Result<Option<FleetConfig>, String>,
    scale_result: Result<(), String>,
    scaled: tokio::sync::Mutex<Vec<String>>,
}

impl MockFleetHook {
    pub fn new(config: Option<FleetConfig>) -> Self {
        Self {
            config: Ok(config),
            scale_result: Ok(()),
            scaled: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn failing_load(message: &str) -> Self {
        Self {
            config: Err(message.to_string()),
            ..Self::new(None)
        }
    }

    pub fn rejecting_scale(config: FleetConfig, message: &str) -> Self {
        Self {
            scale_result: Err(message.to_string()),
            ..Self::new(Some(config))
        }
    }

    pub async fn scaled_groups(&self) -> Vec<String> {
        self.scaled.lock().await.clone()
    }
}

impl FleetHook for MockFleetHook {
    async fn load_fleet_config(&self) -> Result<Option<FleetConfig>, DeciderError> {
        self.config.clone().map_err(DeciderError::Fleet)
    }

    async fn scale_to_zero(&self, auto_scaling_group_name: &str) -> Result<(), DeciderError> {
        self.scaled
            .lock()
            .await
            .push(auto_scaling_group_name.to_string());
        self.scale_result.clone().map_err(DeciderError::Fleet)
    }
}
