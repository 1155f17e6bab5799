//! Mock stages for testing.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::StageLog;
use crate::config::StageDescriptor;
use crate::context::Context;
use crate::core::StageKind;
use crate::errors::{ConfigError, InitError, StageError};
use crate::stages::{RecordEmitter, Stage, StageDependencies};

/// Failure injection shared by the mock stages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FaultConfig {
    /// Fail `initialize`.
    #[serde(default)]
    pub fail_init: bool,
    /// Fail `execute` with this message.
    #[serde(default)]
    pub fail_with: Option<String>,
    /// Panic inside `execute`.
    #[serde(default)]
    pub panic: bool,
}

impl FaultConfig {
    fn initialize(&self, name: &str, log: &StageLog) -> Result<(), InitError> {
        log.push(format!("init:{name}"));
        if self.fail_init {
            return Err(InitError::new(name, "injected init failure"));
        }
        Ok(())
    }

    fn execute(&self, name: &str) -> Result<(), StageError> {
        if self.panic {
            panic!("injected panic in {name}");
        }
        match &self.fail_with {
            Some(message) => Err(StageError::new(name, message.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VecSourceConfig {
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    delay_ms: u64,
    #[serde(flatten)]
    faults: FaultConfig,
}

/// A source that emits a fixed list of records.
///
/// With `fail_with` set, the source fails after emitting all its records.
#[derive(Debug)]
pub struct VecSource {
    name: String,
    config: VecSourceConfig,
    emitter: RecordEmitter,
    log: StageLog,
}

impl VecSource {
    /// Builds the source from `records`, `delay_ms` and fault fields.
    pub fn from_descriptor(
        descriptor: &StageDescriptor,
        deps: &StageDependencies,
        log: StageLog,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: descriptor.name.clone(),
            config: descriptor.parse_config()?,
            emitter: deps.emitter_for(&descriptor.name)?,
            log,
        })
    }
}

#[async_trait]
impl Stage for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    async fn initialize(&mut self) -> Result<(), InitError> {
        self.config.faults.initialize(&self.name, &self.log)
    }

    async fn execute(&self, ctx: Context) -> Result<Context, StageError> {
        self.log.push(format!("exec:{}", self.name));
        for record in &self.config.records {
            if self.config.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.delay_ms)).await;
            }
            if !self.emitter.emit(record.clone()).await {
                break;
            }
        }
        self.config.faults.execute(&self.name)?;
        Ok(ctx)
    }

    async fn cleanup(&mut self) {
        self.log.push(format!("cleanup:{}", self.name));
    }
}

#[derive(Debug, Deserialize)]
struct ProbeConfig {
    #[serde(default)]
    set: serde_json::Map<String, Value>,
    #[serde(flatten)]
    faults: FaultConfig,
}

/// A non-source stage that records every payload it sees.
///
/// It writes the `set` fields into the payload and can inject faults.
#[derive(Debug)]
pub struct ProbeStage {
    name: String,
    kind: StageKind,
    config: ProbeConfig,
    log: StageLog,
}

impl ProbeStage {
    /// Builds a probe of the given kind.
    pub fn from_descriptor(
        descriptor: &StageDescriptor,
        kind: StageKind,
        log: StageLog,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: descriptor.name.clone(),
            kind,
            config: descriptor.parse_config()?,
            log,
        })
    }
}

#[async_trait]
impl Stage for ProbeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn initialize(&mut self) -> Result<(), InitError> {
        self.config.faults.initialize(&self.name, &self.log)
    }

    async fn execute(&self, mut ctx: Context) -> Result<Context, StageError> {
        self.log.push(format!("exec:{}", self.name));
        self.log.record_payload(&self.name, &ctx.payload);
        self.config.faults.execute(&self.name)?;
        ctx.payload
            .extend(self.config.set.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(ctx)
    }

    async fn cleanup(&mut self) {
        self.log.push(format!("cleanup:{}", self.name));
    }
}
