//! Stage kind and built-in stage type enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The role a stage plays in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Produces records (event poller, queue consumer). Only valid at position 0.
    Source,
    /// Adds data from an external call (contract reads).
    Enrichment,
    /// Pure reshaping of the payload (field mapping).
    Transform,
    /// Terminal side effect (queue producer, file writer).
    Sink,
}

impl StageKind {
    /// Returns true for record-producing stages.
    #[must_use]
    pub const fn is_source(self) -> bool {
        matches!(self, Self::Source)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Enrichment => write!(f, "enrichment"),
            Self::Transform => write!(f, "transform"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// Stage types shipped with the engine, keyed by their configuration tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    /// Polls chain logs and decodes events.
    EventMonitor,
    /// Reads records from a message bus topic.
    KafkaConsumer,
    /// Reads contract state for each record.
    ContractCaller,
    /// Multi-rule field mapping.
    DictMapper,
    /// Publishes records to a message bus topic.
    KafkaProducer,
    /// Appends records to a JSON-lines file.
    FileWriter,
}

impl StageType {
    /// Every built-in stage type.
    pub const ALL: [Self; 6] = [
        Self::EventMonitor,
        Self::KafkaConsumer,
        Self::ContractCaller,
        Self::DictMapper,
        Self::KafkaProducer,
        Self::FileWriter,
    ];

    /// The configuration tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::EventMonitor => "event_monitor",
            Self::KafkaConsumer => "kafka_consumer",
            Self::ContractCaller => "contract_caller",
            Self::DictMapper => "dict_mapper",
            Self::KafkaProducer => "kafka_producer",
            Self::FileWriter => "file_writer",
        }
    }

    /// The kind of stage this type builds.
    #[must_use]
    pub const fn kind(self) -> StageKind {
        match self {
            Self::EventMonitor | Self::KafkaConsumer => StageKind::Source,
            Self::ContractCaller => StageKind::Enrichment,
            Self::DictMapper => StageKind::Transform,
            Self::KafkaProducer | Self::FileWriter => StageKind::Sink,
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == s)
            .ok_or_else(|| format!("unknown stage type: {s}"))
    }
}
