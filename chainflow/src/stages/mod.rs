//! Stage trait and built-in stages.
//!
//! Stages are the units of work in a chainflow pipeline. Each declares a
//! [`StageKind`]; exactly one source stage opens the chain and feeds records
//! to the rest through a [`RecordEmitter`].

mod contract_caller;
mod dict_mapper;
mod event_monitor;
mod factory;
mod file_writer;
mod producer;
mod queue_consumer;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bus::MessageBus;
use crate::chain::ChainClient;
use crate::config::ChainSettings;
use crate::context::Context;
use crate::core::StageKind;
use crate::errors::{ConfigError, InitError, StageError};
use crate::tasks::{HeartbeatPulse, HeartbeatReporter};

pub use contract_caller::{AddressSource, CallerConfig, ContractCallerStage};
pub use dict_mapper::DictMapperStage;
pub use event_monitor::{EventMonitorConfig, EventMonitorStage, MonitorMode};
pub use factory::{StageConstructor, StageFactory};
pub use file_writer::{FileWriterConfig, FileWriterStage};
pub use producer::{MessageFormat, ProducerConfig, ProducerStage};
pub use queue_consumer::{QueueConsumerConfig, QueueConsumerStage, TopicList};

/// Trait for pipeline stages.
///
/// The executor calls [`initialize`](Stage::initialize) once before any
/// `execute`, and [`cleanup`](Stage::cleanup) once at the end of the run for
/// every stage that initialized, on every exit path.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Returns the role of the stage in the chain.
    fn kind(&self) -> StageKind;

    /// Acquires resources such as files, ABIs and chain metadata.
    async fn initialize(&mut self) -> Result<(), InitError> {
        Ok(())
    }

    /// Processes one context.
    ///
    /// Source stages receive a seed context, emit records until their input
    /// is exhausted and then return the seed.
    async fn execute(&self, ctx: Context) -> Result<Context, StageError>;

    /// Releases resources.
    async fn cleanup(&mut self) {}
}

/// Hands records from a source stage to the executor.
#[derive(Debug, Clone)]
pub struct RecordEmitter {
    tx: mpsc::Sender<Value>,
}

impl RecordEmitter {
    /// Creates an emitter and the receiver the executor drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Sends one record, waiting while the buffer is full.
    ///
    /// Returns false once the executor stopped listening.
    pub async fn emit(&self, record: Value) -> bool {
        self.tx.send(record).await.is_ok()
    }

    /// Returns true once the executor stopped listening.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a stage may need from outside its own configuration.
///
/// Passed explicitly to the [`StageFactory`]; stages never look up ambient state.
#[derive(Clone, Default)]
pub struct StageDependencies {
    /// Record channel; only handed to the source stage.
    pub emitter: Option<RecordEmitter>,
    /// Ready-made chain clients by name.
    pub chains: HashMap<String, Arc<dyn ChainClient>>,
    /// Chain settings by name, used when no ready-made client exists.
    pub chain_settings: HashMap<String, ChainSettings>,
    /// Message bus for queue stages.
    pub bus: Option<Arc<dyn MessageBus>>,
    /// Heartbeat reporter for source stages.
    pub heartbeat: Option<HeartbeatReporter>,
}

impl StageDependencies {
    /// Creates an empty set of dependencies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the record emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: RecordEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Registers a chain client under a name.
    #[must_use]
    pub fn with_chain(mut self, name: impl Into<String>, client: Arc<dyn ChainClient>) -> Self {
        self.chains.insert(name.into(), client);
        self
    }

    /// Sets the named chain settings.
    #[must_use]
    pub fn with_chain_settings(mut self, settings: HashMap<String, ChainSettings>) -> Self {
        self.chain_settings = settings;
        self
    }

    /// Sets the message bus.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Sets the heartbeat reporter.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatReporter) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Resolves a chain client by name, or builds one for a raw RPC URL.
    pub fn chain_client(
        &self,
        stage: &str,
        chain_name: Option<&str>,
        rpc_url: Option<&str>,
    ) -> Result<Arc<dyn ChainClient>, ConfigError> {
        if let Some(name) = chain_name {
            if let Some(client) = self.chains.get(name) {
                return Ok(Arc::clone(client));
            }
            let settings = self
                .chain_settings
                .get(name)
                .ok_or_else(|| ConfigError::missing(stage, format!("chain '{name}'")))?;
            return connect(
                stage,
                &settings.rpc_url,
                std::time::Duration::from_secs(settings.request_timeout_secs),
            );
        }
        match rpc_url {
            Some(url) => connect(stage, url, std::time::Duration::from_secs(30)),
            None => Err(ConfigError::invalid_stage(
                stage,
                "either chain_name or rpc_url is required",
            )),
        }
    }

    /// The configured chain id for a named chain, if any.
    #[must_use]
    pub fn chain_id_hint(&self, chain_name: Option<&str>) -> Option<u64> {
        chain_name
            .and_then(|name| self.chain_settings.get(name))
            .and_then(|settings| settings.chain_id)
    }

    pub(crate) fn emitter_for(&self, stage: &str) -> Result<RecordEmitter, ConfigError> {
        self.emitter
            .clone()
            .ok_or_else(|| ConfigError::missing(stage, "record emitter"))
    }

    pub(crate) fn bus_for(&self, stage: &str) -> Result<Arc<dyn MessageBus>, ConfigError> {
        self.bus
            .clone()
            .ok_or_else(|| ConfigError::missing(stage, "message bus"))
    }
}

impl Debug for StageDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut chains: Vec<_> = self.chains.keys().collect();
        chains.sort();
        f.debug_struct("StageDependencies")
            .field("emitter", &self.emitter.is_some())
            .field("chains", &chains)
            .field("bus", &self.bus.is_some())
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "rpc")]
fn connect(
    stage: &str,
    url: &str,
    timeout: std::time::Duration,
) -> Result<Arc<dyn ChainClient>, ConfigError> {
    let client = crate::chain::JsonRpcClient::new(url, timeout)
        .map_err(|e| ConfigError::invalid_stage(stage, e.to_string()))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "rpc"))]
fn connect(
    stage: &str,
    url: &str,
    _timeout: std::time::Duration,
) -> Result<Arc<dyn ChainClient>, ConfigError> {
    Err(ConfigError::invalid_stage(
        stage,
        format!("cannot connect to {url}: built without the rpc feature"),
    ))
}

/// Starts a heartbeat pulse when both a reporter and a task id are present.
pub(crate) fn start_pulse(
    heartbeat: Option<&HeartbeatReporter>,
    ctx: &Context,
) -> Option<HeartbeatPulse> {
    match (heartbeat, ctx.task_id()) {
        (Some(reporter), Some(task_id)) => Some(reporter.spawn_pulse(task_id)),
        _ => None,
    }
}

/// Converts a seconds value from configuration into a duration.
pub(crate) fn seconds(
    stage: &str,
    field: &str,
    secs: f64,
) -> Result<std::time::Duration, ConfigError> {
    std::time::Duration::try_from_secs_f64(secs).map_err(|_| {
        ConfigError::invalid_stage(stage, format!("{field} must be a non-negative number of seconds"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use serde_json::json;

    #[tokio::test]
    async fn test_emitter_reports_closed_receiver() {
        let (emitter, mut rx) = RecordEmitter::channel(2);
        assert!(emitter.emit(json!({"n": 1})).await);
        assert_eq!(rx.recv().await, Some(json!({"n": 1})));
        drop(rx);
        assert!(emitter.is_closed());
        assert!(!emitter.emit(json!({"n": 2})).await);
    }

    #[test]
    fn test_chain_client_prefers_registered_clients() {
        let deps =
            StageDependencies::new().with_chain("mainnet", Arc::new(MockChainClient::new()));
        assert!(deps.chain_client("s", Some("mainnet"), None).is_ok());
        assert!(matches!(
            deps.chain_client("s", Some("goerli"), None),
            Err(ConfigError::MissingDependency { .. })
        ));
        assert!(matches!(
            deps.chain_client("s", None, None),
            Err(ConfigError::InvalidStageConfig { .. })
        ));
    }

    #[test]
    fn test_chain_id_hint() {
        let mut settings = HashMap::new();
        settings.insert(
            "mainnet".to_string(),
            ChainSettings {
                rpc_url: "http://localhost:8545".to_string(),
                chain_id: Some(1),
                request_timeout_secs: 30,
            },
        );
        let deps = StageDependencies::new().with_chain_settings(settings);
        assert_eq!(deps.chain_id_hint(Some("mainnet")), Some(1));
        assert_eq!(deps.chain_id_hint(None), None);
    }

    #[test]
    fn test_missing_emitter_and_bus() {
        let deps = StageDependencies::new();
        assert!(deps.emitter_for("src").is_err());
        assert!(deps.bus_for("sink").is_err());
    }

    #[test]
    fn test_seconds_rejects_negative() {
        assert_eq!(
            seconds("s", "poll_interval", 1.5).ok(),
            Some(std::time::Duration::from_millis(1500))
        );
        assert!(seconds("s", "poll_interval", -1.0).is_err());
        assert!(seconds("s", "poll_interval", f64::NAN).is_err());
    }
}
