//! Message bus source.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{start_pulse, RecordEmitter, Stage, StageDependencies};
use crate::bus::MessageBus;
use crate::config::StageDescriptor;
use crate::context::Context;
use crate::core::StageKind;
use crate::errors::{ConfigError, StageError};
use crate::tasks::HeartbeatReporter;

/// One topic or several.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TopicList {
    /// A single topic.
    One(String),
    /// Several topics.
    Many(Vec<String>),
}

impl TopicList {
    /// The topics as a list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(topic) => vec![topic.clone()],
            Self::Many(topics) => topics.clone(),
        }
    }
}

/// Configuration of a `kafka_consumer` stage.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConsumerConfig {
    /// Topics to read.
    pub topic: TopicList,
    /// Consumer group; defaults to the stage name.
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Source stage reading records from the message bus.
pub struct QueueConsumerStage {
    name: String,
    topics: Vec<String>,
    group_id: String,
    bus: Arc<dyn MessageBus>,
    emitter: RecordEmitter,
    heartbeat: Option<HeartbeatReporter>,
}

impl QueueConsumerStage {
    /// Builds the stage; needs a record emitter and a message bus.
    pub fn from_descriptor(
        descriptor: &StageDescriptor,
        deps: &StageDependencies,
    ) -> Result<Self, ConfigError> {
        let config: QueueConsumerConfig = descriptor.parse_config()?;
        let topics = config.topic.to_vec();
        if topics.is_empty() || topics.iter().any(String::is_empty) {
            return Err(ConfigError::invalid_stage(&descriptor.name, "topic must not be empty"));
        }
        Ok(Self {
            group_id: config.group_id.unwrap_or_else(|| descriptor.name.clone()),
            topics,
            bus: deps.bus_for(&descriptor.name)?,
            emitter: deps.emitter_for(&descriptor.name)?,
            heartbeat: deps.heartbeat.clone(),
            name: descriptor.name.clone(),
        })
    }
}

/// Objects pass through; anything else is wrapped as `{"value": ...}`.
fn as_record(payload: Value) -> Value {
    match payload {
        Value::Object(_) => payload,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}

#[async_trait]
impl Stage for QueueConsumerStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    async fn execute(&self, ctx: Context) -> Result<Context, StageError> {
        let _pulse = start_pulse(self.heartbeat.as_ref(), &ctx);
        let mut messages = self
            .bus
            .subscribe(&self.topics, &self.group_id)
            .await
            .map_err(|e| StageError::new(&self.name, e.to_string()))?;
        info!(stage = %self.name, topics = ?self.topics, group = %self.group_id, "Consuming");

        let mut consumed = 0_u64;
        while let Some(message) = messages.next().await {
            debug!(stage = %self.name, topic = %message.topic, offset = message.offset, "Message received");
            if !self.emitter.emit(as_record(message.payload)).await {
                break;
            }
            consumed += 1;
        }
        info!(stage = %self.name, consumed, "Consumer finished");
        Ok(ctx)
    }
}

impl std::fmt::Debug for QueueConsumerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumerStage")
            .field("name", &self.name)
            .field("topics", &self.topics)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}
