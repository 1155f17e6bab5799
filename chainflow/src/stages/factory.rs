//! Registry of stage constructors keyed by type tag.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    ContractCallerStage, DictMapperStage, EventMonitorStage, FileWriterStage, ProducerStage,
    QueueConsumerStage, Stage, StageDependencies,
};
use crate::config::StageDescriptor;
use crate::core::{StageKind, StageType};
use crate::errors::ConfigError;

/// Builds a stage from its descriptor and injected dependencies.
pub type StageConstructor = Arc<
    dyn Fn(&StageDescriptor, &StageDependencies) -> Result<Box<dyn Stage>, ConfigError>
        + Send
        + Sync,
>;

/// Append-only registry of stage types.
#[derive(Clone, Default)]
pub struct StageFactory {
    registry: HashMap<String, (StageKind, StageConstructor)>,
}

impl StageFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a factory with every built-in stage type registered.
    #[must_use]
    pub fn builtin() -> Self {
        let mut factory = Self::new();
        for stage_type in StageType::ALL {
            let constructor: StageConstructor = match stage_type {
                StageType::EventMonitor => Arc::new(|d, deps| {
                    Ok(Box::new(EventMonitorStage::from_descriptor(d, deps)?) as Box<dyn Stage>)
                }),
                StageType::KafkaConsumer => Arc::new(|d, deps| {
                    Ok(Box::new(QueueConsumerStage::from_descriptor(d, deps)?) as Box<dyn Stage>)
                }),
                StageType::ContractCaller => Arc::new(|d, deps| {
                    Ok(Box::new(ContractCallerStage::from_descriptor(d, deps)?) as Box<dyn Stage>)
                }),
                StageType::DictMapper => Arc::new(|d, _| {
                    Ok(Box::new(DictMapperStage::from_descriptor(d)?) as Box<dyn Stage>)
                }),
                StageType::KafkaProducer => Arc::new(|d, deps| {
                    Ok(Box::new(ProducerStage::from_descriptor(d, deps)?) as Box<dyn Stage>)
                }),
                StageType::FileWriter => Arc::new(|d, _| {
                    Ok(Box::new(FileWriterStage::from_descriptor(d)?) as Box<dyn Stage>)
                }),
            };
            factory
                .registry
                .insert(stage_type.tag().to_string(), (stage_type.kind(), constructor));
        }
        factory
    }

    /// Registers a stage type. A tag can only be registered once.
    pub fn register<F>(
        &mut self,
        tag: impl Into<String>,
        kind: StageKind,
        constructor: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&StageDescriptor, &StageDependencies) -> Result<Box<dyn Stage>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        let tag = tag.into();
        if self.registry.contains_key(&tag) {
            return Err(ConfigError::DuplicateStageType(tag));
        }
        self.registry.insert(tag, (kind, Arc::new(constructor)));
        Ok(())
    }

    /// The kind registered for a tag.
    #[must_use]
    pub fn kind_of(&self, tag: &str) -> Option<StageKind> {
        self.registry.get(tag).map(|(kind, _)| *kind)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<_> = self.registry.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Constructs the stage a descriptor names.
    pub fn create(
        &self,
        descriptor: &StageDescriptor,
        deps: &StageDependencies,
    ) -> Result<Box<dyn Stage>, ConfigError> {
        let (_, constructor) = self.registry.get(&descriptor.stage_type).ok_or_else(|| {
            ConfigError::UnknownStageType {
                stage: descriptor.name.clone(),
                stage_type: descriptor.stage_type.clone(),
            }
        })?;
        constructor(descriptor, deps)
    }
}

impl std::fmt::Debug for StageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageFactory")
            .field("tags", &self.tags())
            .finish()
    }
}
