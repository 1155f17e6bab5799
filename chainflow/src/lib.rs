//! # Chainflow
//!
//! Configurable pipelines over blockchain events, with heartbeat-based task
//! liveness.
//!
//! A pipeline is a linear chain of stages declared in JSON:
//!
//! - **Source stages** produce records: an EVM event poller or a queue consumer
//! - **Enrichment and transform stages** add to or reshape each record
//! - **Sink stages** deliver records to a queue or a file
//!
//! Every run is tracked as a task record. Source stages pulse heartbeats into
//! it, and a [`tasks::TimeoutMonitor`] fails runs that stop reporting.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chainflow::prelude::*;
//!
//! let config = PipelineConfig::from_json_str(r#"{
//!     "pipeline_name": "transfers",
//!     "components": [
//!         {"name": "poller", "type": "event_monitor", "chain_name": "eth",
//!          "event_signatures": ["Transfer(address indexed from, address indexed to, uint256 value)"]},
//!         {"name": "mapper", "type": "dict_mapper",
//!          "mapping_rules": [{"source_key": "from", "target_key": "sender"}]},
//!         {"name": "out", "type": "file_writer", "path": "transfers.jsonl"}
//!     ]
//! }"#)?;
//!
//! let service = PipelineService::new(
//!     Arc::new(InMemoryTaskStore::new()),
//!     Arc::new(SystemClock),
//!     ServiceSettings::default(),
//! );
//! let task_id = service.run_pipeline(&config, None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod bus;
pub mod cancellation;
pub mod chain;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod mapping;
pub mod observability;
pub mod pipeline;
pub mod service;
pub mod stages;
pub mod tasks;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::{InMemoryBus, MessageBus};
    pub use crate::cancellation::CancellationToken;
    pub use crate::chain::ChainClient;
    pub use crate::config::{PipelineConfig, ServiceSettings, StageDescriptor};
    pub use crate::context::Context;
    pub use crate::core::{StageKind, StageType};
    pub use crate::errors::{ChainflowError, ConfigError, InitError, SourceFault, StageError};
    pub use crate::mapping::{FieldMapper, FieldMapperConfig};
    pub use crate::pipeline::{Pipeline, PipelineBuilder, RunOutcome, RunResult};
    pub use crate::service::PipelineService;
    pub use crate::stages::{Stage, StageDependencies, StageFactory};
    pub use crate::tasks::{
        Clock, HeartbeatReporter, InMemoryTaskStore, SystemClock, TaskId, TaskRecord,
        TaskStatus, TaskStore, TimeoutMonitor,
    };
}
