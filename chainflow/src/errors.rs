//! Error types for the chainflow engine.
//!
//! Failures are split by how far they reach:
//!
//! - [`ConfigError`] stops a pipeline before it is built; no task record exists.
//! - [`InitError`] and [`SourceFault`] end a run with a failed task record.
//! - [`StageError`] is isolated by the executor and never ends a run.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::tasks::TaskStoreError;

/// The main error type for chainflow operations.
#[derive(Debug, Error)]
pub enum ChainflowError {
    /// The pipeline configuration was rejected.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A stage failed to initialize.
    #[error("{0}")]
    Init(#[from] InitError),

    /// The source stage failed.
    #[error("{0}")]
    Source(#[from] SourceFault),

    /// The task store rejected an operation.
    #[error("{0}")]
    TaskStore(#[from] TaskStoreError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while turning configuration into a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No constructor is registered for the stage type tag.
    #[error("unknown stage type '{stage_type}' for stage '{stage}'")]
    UnknownStageType {
        /// Stage name from the descriptor.
        stage: String,
        /// The unregistered tag.
        stage_type: String,
    },

    /// The stage chain as a whole is malformed.
    #[error("invalid pipeline configuration: {0}")]
    InvalidPipelineConfig(String),

    /// A single stage's configuration map is malformed.
    #[error("invalid configuration for stage '{stage}': {message}")]
    InvalidStageConfig {
        /// Stage name.
        stage: String,
        /// What was wrong.
        message: String,
    },

    /// A stage needs a collaborator that was not supplied.
    #[error("stage '{stage}' requires {dependency}")]
    MissingDependency {
        /// Stage name.
        stage: String,
        /// Description of the missing collaborator.
        dependency: String,
    },

    /// A stage type tag was registered twice.
    #[error("stage type '{0}' is already registered")]
    DuplicateStageType(String),
}

impl ConfigError {
    /// Creates an [`ConfigError::InvalidStageConfig`].
    #[must_use]
    pub fn invalid_stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidStageConfig {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates an [`ConfigError::InvalidPipelineConfig`].
    #[must_use]
    pub fn invalid_pipeline(message: impl Into<String>) -> Self {
        Self::InvalidPipelineConfig(message.into())
    }

    /// Creates a [`ConfigError::MissingDependency`].
    #[must_use]
    pub fn missing(stage: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            stage: stage.into(),
            dependency: dependency.into(),
        }
    }

    /// Stable error code for logs and API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownStageType { .. } => "CONFIG-UNKNOWN-STAGE-TYPE",
            Self::InvalidPipelineConfig(_) => "CONFIG-INVALID-PIPELINE",
            Self::InvalidStageConfig { .. } => "CONFIG-INVALID-STAGE",
            Self::MissingDependency { .. } => "CONFIG-MISSING-DEPENDENCY",
            Self::DuplicateStageType(_) => "CONFIG-DUPLICATE-STAGE-TYPE",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), Value::String(self.code().to_string()));
        map.insert("message".to_string(), Value::String(self.to_string()));
        map
    }
}

/// A stage could not acquire its resources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage '{stage}' failed to initialize: {message}")]
pub struct InitError {
    /// Stage name.
    pub stage: String,
    /// Failure description.
    pub message: String,
}

impl InitError {
    /// Creates a new init error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// A non-source stage failed on one context.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("stage '{stage}' failed: {message}")]
pub struct StageError {
    /// Stage name.
    pub stage: String,
    /// Failure description.
    pub message: String,
    /// Whether the stage panicked rather than returning an error.
    pub panicked: bool,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            panicked: false,
        }
    }

    /// Creates a stage error from a caught panic payload.
    #[must_use]
    pub fn from_panic(stage: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self {
            stage: stage.into(),
            message: format!("panicked: {message}"),
            panicked: true,
        }
    }
}

/// The source stage failed; fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("source stage '{stage}' failed: {message}")]
pub struct SourceFault {
    /// Stage name.
    pub stage: String,
    /// Failure description.
    pub message: String,
}

impl SourceFault {
    /// Creates a new source fault.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

impl From<StageError> for SourceFault {
    fn from(err: StageError) -> Self {
        Self {
            stage: err.stage,
            message: err.message,
        }
    }
}

/// Result type alias for chainflow operations.
pub type Result<T> = std::result::Result<T, ChainflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_codes_are_distinct() {
        let errors = [
            ConfigError::UnknownStageType {
                stage: "a".to_string(),
                stage_type: "nope".to_string(),
            },
            ConfigError::invalid_pipeline("empty"),
            ConfigError::invalid_stage("a", "bad"),
            ConfigError::missing("a", "a chain client"),
            ConfigError::DuplicateStageType("dict_mapper".to_string()),
        ];
        let mut codes: Vec<_> = errors.iter().map(ConfigError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_config_error_to_dict() {
        let err = ConfigError::UnknownStageType {
            stage: "mapper".to_string(),
            stage_type: "nope".to_string(),
        };
        let dict = err.to_dict();
        assert_eq!(dict["code"], "CONFIG-UNKNOWN-STAGE-TYPE");
        assert!(dict["message"].as_str().is_some_and(|m| m.contains("'nope'")));
    }

    #[test]
    fn test_stage_error_from_panic_payloads() {
        let err = StageError::from_panic("s", &"boom");
        assert!(err.panicked);
        assert_eq!(err.message, "panicked: boom");

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let err = StageError::from_panic("s", owned.as_ref());
        assert_eq!(err.message, "panicked: owned");
    }

    #[test]
    fn test_source_fault_from_stage_error() {
        let fault: SourceFault = StageError::new("poller", "rpc down").into();
        assert_eq!(fault.stage, "poller");
        assert_eq!(fault.to_string(), "source stage 'poller' failed: rpc down");
    }

    #[test]
    fn test_chainflow_error_wraps_config() {
        let err: ChainflowError = ConfigError::invalid_pipeline("empty chain").into();
        assert_eq!(err.to_string(), "invalid pipeline configuration: empty chain");
    }
}
