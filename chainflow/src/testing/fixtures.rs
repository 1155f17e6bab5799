//! Test fixtures for pipeline testing.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::mocks::{ProbeStage, VecSource};
use crate::config::{PipelineConfig, StageDescriptor};
use crate::core::StageKind;
use crate::stages::{Stage, StageFactory};

/// Shared journal of lifecycle calls and observed payloads.
#[derive(Debug, Clone, Default)]
pub struct StageLog {
    events: Arc<Mutex<Vec<String>>>,
    payloads: Arc<Mutex<HashMap<String, Vec<Map<String, Value>>>>>,
}

impl StageLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event such as `init:sink`.
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    /// Every event so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// How many times an event was logged.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Stores a payload a stage received.
    pub fn record_payload(&self, stage: &str, payload: &Map<String, Value>) {
        self.payloads
            .lock()
            .entry(stage.to_string())
            .or_default()
            .push(payload.clone());
    }

    /// Payloads a stage received, in order.
    #[must_use]
    pub fn payloads(&self, stage: &str) -> Vec<Map<String, Value>> {
        self.payloads.lock().get(stage).cloned().unwrap_or_default()
    }
}

/// A factory with the built-in stages plus the mocks.
///
/// Mock tags: `vec_source` (source), `probe` (transform), `probe_enrichment`
/// (enrichment) and `probe_sink` (sink).
#[must_use]
pub fn test_factory(log: &StageLog) -> StageFactory {
    let mut factory = StageFactory::builtin();
    let mocks: [(&str, StageKind); 3] = [
        ("probe", StageKind::Transform),
        ("probe_enrichment", StageKind::Enrichment),
        ("probe_sink", StageKind::Sink),
    ];
    let source_log = log.clone();
    let registered = factory.register("vec_source", StageKind::Source, move |d, deps| {
        Ok(Box::new(VecSource::from_descriptor(d, deps, source_log.clone())?) as Box<dyn Stage>)
    });
    debug_assert!(registered.is_ok());
    for (tag, kind) in mocks {
        let probe_log = log.clone();
        let registered = factory.register(tag, kind, move |d, _| {
            Ok(Box::new(ProbeStage::from_descriptor(d, kind, probe_log.clone())?) as Box<dyn Stage>)
        });
        debug_assert!(registered.is_ok());
    }
    factory
}

/// Shorthand for a pipeline config built from `(name, type, fields)` triples.
#[must_use]
pub fn pipeline_config(id: &str, stages: Vec<(&str, &str, Value)>) -> PipelineConfig {
    PipelineConfig::new(
        id,
        stages
            .into_iter()
            .map(|(name, stage_type, config)| StageDescriptor::new(name, stage_type, config))
            .collect(),
    )
}
