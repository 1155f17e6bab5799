//! Configuration types.
//!
//! - [`PipelineConfig`]: the declarative stage chain of one pipeline
//! - [`ServiceSettings`]: process-wide settings for the service and monitor

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ChainflowError, ConfigError};

/// One stage of a pipeline: name, type tag and type-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Stage name, unique within the pipeline.
    pub name: String,
    /// Registered stage type tag, e.g. `dict_mapper`.
    #[serde(rename = "type")]
    pub stage_type: String,
    /// Every other field of the component entry.
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl StageDescriptor {
    /// Creates a descriptor. Non-object `config` values are ignored.
    #[must_use]
    pub fn new(name: impl Into<String>, stage_type: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            stage_type: stage_type.into(),
            config: match config {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    /// Deserializes the type-specific fields into a typed config.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(Value::Object(self.config.clone()))
            .map_err(|e| ConfigError::invalid_stage(&self.name, e.to_string()))
    }
}

/// Declarative definition of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Human-readable name.
    #[serde(default)]
    pub pipeline_name: Option<String>,
    /// Stable identifier; falls back to the name.
    #[serde(default)]
    pub pipeline_id: Option<String>,
    /// Ordered stage chain; the first entry must be a source.
    pub components: Vec<StageDescriptor>,
}

impl PipelineConfig {
    /// Creates a config from descriptors.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, components: Vec<StageDescriptor>) -> Self {
        Self {
            pipeline_name: None,
            pipeline_id: Some(pipeline_id.into()),
            components,
        }
    }

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::invalid_pipeline(e.to_string()))
    }

    /// Reads and parses a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ChainflowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&raw)?)
    }

    /// The pipeline id: `pipeline_id`, else `pipeline_name`, else a fresh UUID.
    #[must_use]
    pub fn resolved_id(&self) -> String {
        self.pipeline_id
            .clone()
            .or_else(|| self.pipeline_name.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// Connection settings for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSettings {
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// Chain id reported in emitted records; queried from the node if absent.
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

/// Timeout monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Seconds between scans.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Seconds without liveness before a task is failed.
    #[serde(default = "default_timeout_threshold")]
    pub timeout_threshold_secs: u64,
    /// Seconds to wait after a failed scan.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Fail leftover running records when the process starts.
    #[serde(default = "default_true")]
    pub reset_on_startup: bool,
}

fn default_check_interval() -> u64 {
    300
}

fn default_timeout_threshold() -> u64 {
    60 * 60
}

fn default_error_backoff() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            timeout_threshold_secs: default_timeout_threshold(),
            error_backoff_secs: default_error_backoff(),
            reset_on_startup: default_true(),
        }
    }
}

impl MonitorSettings {
    /// Scan interval.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Staleness threshold.
    #[must_use]
    pub const fn timeout_threshold(&self) -> Duration {
        Duration::from_secs(self.timeout_threshold_secs)
    }

    /// Backoff after a failed scan.
    #[must_use]
    pub const fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// Heartbeat settings for source stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Whether source stages pulse heartbeats at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl HeartbeatSettings {
    /// Heartbeat interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Directory for per-run log files when no explicit path is given.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Emit JSON lines on stdout instead of text.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            log_dir: default_log_dir(),
            json: false,
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Timeout monitor.
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Heartbeats.
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    /// Named chains stages can refer to with `chain_name`.
    #[serde(default)]
    pub chains: HashMap<String, ChainSettings>,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Records buffered between the source and the rest of the chain.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    64
}

impl ServiceSettings {
    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ChainflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ChainflowError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Adds a named chain.
    #[must_use]
    pub fn with_chain(mut self, name: impl Into<String>, chain: ChainSettings) -> Self {
        self.chains.insert(name.into(), chain);
        self
    }

    /// Log path for a run when the caller does not supply one.
    #[must_use]
    pub fn default_log_path(&self, pipeline_id: &str) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        self.logging
            .log_dir
            .join(format!("{pipeline_id}_{stamp}.log"))
    }
}
