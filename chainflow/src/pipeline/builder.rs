//! Pipeline builder with validation.

use std::collections::HashSet;

use super::Pipeline;
use crate::config::PipelineConfig;
use crate::core::StageKind;
use crate::errors::ConfigError;
use crate::stages::{RecordEmitter, StageDependencies, StageFactory};

/// Default number of records buffered between the source and the chain.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Builds validated pipelines from configuration.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    factory: StageFactory,
    dependencies: StageDependencies,
    channel_capacity: usize,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new(StageFactory::builtin())
    }
}

impl PipelineBuilder {
    /// Creates a builder using `factory` to construct stages.
    #[must_use]
    pub fn new(factory: StageFactory) -> Self {
        Self {
            factory,
            dependencies: StageDependencies::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Sets the dependencies handed to every stage constructor.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: StageDependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the source-to-chain buffer size.
    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// The stage factory.
    #[must_use]
    pub const fn factory(&self) -> &StageFactory {
        &self.factory
    }

    /// Checks the stage chain shape without constructing any stage.
    ///
    /// The chain must be non-empty, open with a source stage, contain no
    /// other source and use unique stage names.
    pub fn validate(&self, config: &PipelineConfig) -> Result<(), ConfigError> {
        let Some(first) = config.components.first() else {
            return Err(ConfigError::invalid_pipeline("pipeline has no components"));
        };

        let mut names = HashSet::new();
        for (index, descriptor) in config.components.iter().enumerate() {
            let kind = self.factory.kind_of(&descriptor.stage_type).ok_or_else(|| {
                ConfigError::UnknownStageType {
                    stage: descriptor.name.clone(),
                    stage_type: descriptor.stage_type.clone(),
                }
            })?;
            if index == 0 && !kind.is_source() {
                return Err(ConfigError::invalid_pipeline(format!(
                    "first stage '{}' is a {kind} stage; a pipeline must start with a source",
                    first.name
                )));
            }
            if index > 0 && kind == StageKind::Source {
                return Err(ConfigError::invalid_pipeline(format!(
                    "stage '{}' at position {index} is a source; only the first stage may be",
                    descriptor.name
                )));
            }
            if descriptor.name.is_empty() {
                return Err(ConfigError::invalid_pipeline(format!(
                    "stage at position {index} has no name"
                )));
            }
            if !names.insert(descriptor.name.as_str()) {
                return Err(ConfigError::invalid_pipeline(format!(
                    "duplicate stage name '{}'",
                    descriptor.name
                )));
            }
        }
        Ok(())
    }

    /// Validates the chain, then constructs every stage.
    ///
    /// Only the source stage receives the record emitter.
    pub fn build(&self, config: &PipelineConfig) -> Result<Pipeline, ConfigError> {
        self.validate(config)?;

        let (emitter, records) = RecordEmitter::channel(self.channel_capacity);
        let source_deps = self.dependencies.clone().with_emitter(emitter);
        let mut chain_deps = self.dependencies.clone();
        chain_deps.emitter = None;

        let stages = config
            .components
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let deps = if index == 0 { &source_deps } else { &chain_deps };
                self.factory.create(descriptor, deps)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Pipeline::new(config.resolved_id(), stages, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageDescriptor;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn descriptor(name: &str, stage_type: &str) -> StageDescriptor {
        StageDescriptor::new(name, stage_type, json!({}))
    }

    #[test]
    fn test_empty_pipeline_is_rejected() {
        let err = PipelineBuilder::default()
            .validate(&PipelineConfig::new("p", Vec::new()))
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG-INVALID-PIPELINE");
    }

    #[test]
    fn test_first_stage_must_be_a_source() {
        let config = PipelineConfig::new(
            "p",
            vec![descriptor("map", "dict_mapper"), descriptor("events", "event_monitor")],
        );
        let err = PipelineBuilder::default().build(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPipelineConfig(ref m) if m.contains("'map'")));
    }

    #[test]
    fn test_second_source_is_rejected() {
        let config = PipelineConfig::new(
            "p",
            vec![descriptor("a", "event_monitor"), descriptor("b", "kafka_consumer")],
        );
        let err = PipelineBuilder::default().validate(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPipelineConfig(ref m) if m.contains("'b'")));
    }

    #[test]
    fn test_unknown_type_and_duplicate_names() {
        let unknown = PipelineConfig::new("p", vec![descriptor("a", "websocket_source")]);
        assert!(matches!(
            PipelineBuilder::default().validate(&unknown),
            Err(ConfigError::UnknownStageType { .. })
        ));

        let duplicate = PipelineConfig::new(
            "p",
            vec![
                descriptor("a", "kafka_consumer"),
                descriptor("m", "dict_mapper"),
                descriptor("m", "dict_mapper"),
            ],
        );
        let err = PipelineBuilder::default().validate(&duplicate).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPipelineConfig(ref m) if m.contains("duplicate")));
    }
}
