//! Message bus sink.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{Stage, StageDependencies};
use crate::bus::MessageBus;
use crate::config::StageDescriptor;
use crate::context::{lookup_path, Context};
use crate::core::StageKind;
use crate::errors::{ConfigError, StageError};

/// Shape of published messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// The payload alone.
    #[default]
    Simple,
    /// Payload wrapped with metadata, pipeline id and timestamp.
    Full,
}

/// Configuration of a `kafka_producer` stage.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// Destination topic.
    pub topic: String,
    /// Message shape.
    #[serde(default)]
    pub message_format: MessageFormat,
    /// Payload path used as the message key.
    #[serde(default)]
    pub key_field: Option<String>,
}

/// Sink stage publishing each payload to a topic.
pub struct ProducerStage {
    name: String,
    config: ProducerConfig,
    bus: Arc<dyn MessageBus>,
}

impl ProducerStage {
    /// Builds the stage; needs a message bus.
    pub fn from_descriptor(
        descriptor: &StageDescriptor,
        deps: &StageDependencies,
    ) -> Result<Self, ConfigError> {
        let config: ProducerConfig = descriptor.parse_config()?;
        if config.topic.is_empty() {
            return Err(ConfigError::invalid_stage(&descriptor.name, "topic must not be empty"));
        }
        Ok(Self {
            name: descriptor.name.clone(),
            bus: deps.bus_for(&descriptor.name)?,
            config,
        })
    }

    fn message(&self, ctx: &Context) -> Value {
        match self.config.message_format {
            MessageFormat::Simple => Value::Object(ctx.payload.clone()),
            MessageFormat::Full => json!({
                "payload": ctx.payload,
                "metadata": ctx.metadata,
                "pipeline_id": ctx.pipeline_id(),
                "task_id": ctx.task_id(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        }
    }

    fn key(&self, ctx: &Context) -> Option<String> {
        let value = lookup_path(&ctx.payload, self.config.key_field.as_deref()?)?;
        Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[async_trait]
impl Stage for ProducerStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    async fn execute(&self, ctx: Context) -> Result<Context, StageError> {
        let offset = self
            .bus
            .publish(&self.config.topic, self.key(&ctx), self.message(&ctx))
            .await
            .map_err(|e| StageError::new(&self.name, e.to_string()))?;
        debug!(stage = %self.name, topic = %self.config.topic, offset, "Published record");
        Ok(ctx)
    }
}

impl std::fmt::Debug for ProducerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerStage")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
