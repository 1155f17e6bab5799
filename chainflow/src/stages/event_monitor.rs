//! Chain event source.
//!
//! Polls `eth_getLogs` for a contract, decodes matching events and emits one
//! record per log. Historical mode walks a fixed block range and stops;
//! realtime mode follows the chain head until the executor stops listening.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{seconds, start_pulse, RecordEmitter, Stage, StageDependencies};
use crate::chain::abi::{Abi, EventSignature};
use crate::chain::{ChainClient, LogFilter, RawLog, RpcError};
use crate::config::StageDescriptor;
use crate::context::Context;
use crate::core::StageKind;
use crate::errors::{ConfigError, InitError, StageError};
use crate::tasks::HeartbeatReporter;

/// How the monitor walks the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    /// Follow the head until stopped.
    #[default]
    Realtime,
    /// Walk `[start_block, end_block]` once.
    Historical,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_batch_size() -> u64 {
    100
}

fn default_error_backoff() -> f64 {
    5.0
}

fn default_max_consecutive_errors() -> u32 {
    10
}

/// Configuration of an `event_monitor` stage.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMonitorConfig {
    /// Named chain from the service settings.
    #[serde(default)]
    pub chain_name: Option<String>,
    /// Raw RPC endpoint, used when no chain name is given.
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Chain id written to records; asked from the node when unset.
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Contract whose logs are read; any contract when unset.
    #[serde(default)]
    pub contract_address: Option<Address>,
    /// JSON ABI file with event definitions.
    #[serde(default)]
    pub abi_path: Option<PathBuf>,
    /// Human-readable event signatures.
    #[serde(default)]
    pub event_signatures: Vec<String>,
    /// Restricts decoding to these event names.
    #[serde(default)]
    pub events_to_monitor: Vec<String>,
    /// Realtime or historical.
    #[serde(default)]
    pub mode: MonitorMode,
    /// First block to read.
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Last block to read in historical mode; the head when unset.
    #[serde(default)]
    pub end_block: Option<u64>,
    /// In realtime mode, start at the current head instead of `start_block`.
    #[serde(default = "default_true")]
    pub start_from_latest: bool,
    /// Seconds between head polls once caught up.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Blocks per `eth_getLogs` request.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Keep only events with an address argument in this list.
    #[serde(default)]
    pub address_filters: Vec<String>,
    /// Seconds to wait after a failed RPC call.
    #[serde(default = "default_error_backoff")]
    pub error_backoff: f64,
    /// Consecutive RPC failures tolerated before the source gives up.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

/// Source stage emitting decoded chain events.
pub struct EventMonitorStage {
    name: String,
    config: EventMonitorConfig,
    client: Arc<dyn ChainClient>,
    emitter: RecordEmitter,
    heartbeat: Option<HeartbeatReporter>,
    parsed_signatures: Vec<EventSignature>,
    events: HashMap<B256, EventSignature>,
    chain_id: Option<u64>,
    chain_label: String,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl EventMonitorStage {
    /// Builds the stage; needs a record emitter and a chain client.
    pub fn from_descriptor(
        descriptor: &StageDescriptor,
        deps: &StageDependencies,
    ) -> Result<Self, ConfigError> {
        let name = descriptor.name.clone();
        let config: EventMonitorConfig = descriptor.parse_config()?;
        if config.abi_path.is_none() && config.event_signatures.is_empty() {
            return Err(ConfigError::invalid_stage(
                &name,
                "either abi_path or event_signatures is required",
            ));
        }
        if config.batch_size == 0 {
            return Err(ConfigError::invalid_stage(&name, "batch_size must be positive"));
        }
        let parsed_signatures = config
            .event_signatures
            .iter()
            .map(|s| EventSignature::parse(s))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::invalid_stage(&name, e.to_string()))?;

        let client =
            deps.chain_client(&name, config.chain_name.as_deref(), config.rpc_url.as_deref())?;
        let emitter = deps.emitter_for(&name)?;
        let chain_id = config
            .chain_id
            .or_else(|| deps.chain_id_hint(config.chain_name.as_deref()));
        let chain_label = config
            .chain_name
            .clone()
            .or_else(|| config.rpc_url.clone())
            .unwrap_or_default();

        Ok(Self {
            poll_interval: seconds(&name, "poll_interval", config.poll_interval)?,
            error_backoff: seconds(&name, "error_backoff", config.error_backoff)?,
            heartbeat: deps.heartbeat.clone(),
            name,
            config,
            client,
            emitter,
            parsed_signatures,
            events: HashMap::new(),
            chain_id,
            chain_label,
        })
    }

    /// Decoded events by `topic0`, available after initialization.
    #[must_use]
    pub fn events(&self) -> Vec<&EventSignature> {
        let mut events: Vec<_> = self.events.values().collect();
        events.sort_by(|a, b| a.name.cmp(&b.name));
        events
    }

    async fn run_historical(&self) -> Result<(), StageError> {
        let head = self.retrying("eth_blockNumber", || self.client.block_number()).await?;
        let from = self.config.start_block.unwrap_or(0);
        let to = self.config.end_block.map_or(head, |end| end.min(head));
        info!(stage = %self.name, from, to, "Scanning historical blocks");

        let mut start = from;
        while start <= to {
            let end = to.min(start.saturating_add(self.config.batch_size - 1));
            let filter = self.filter(start, end);
            let logs = self
                .retrying("eth_getLogs", || self.client.get_logs(&filter))
                .await?;
            if !self.emit_logs(logs).await {
                return Ok(());
            }
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        Ok(())
    }

    async fn run_realtime(&self) -> Result<(), StageError> {
        let mut next = match self.config.start_block {
            Some(block) if !self.config.start_from_latest => block,
            _ => self.retrying("eth_blockNumber", || self.client.block_number()).await?,
        };
        info!(stage = %self.name, from = next, "Following chain head");

        let mut errors = 0_u32;
        loop {
            if self.emitter.is_closed() {
                return Ok(());
            }
            let step = match self.client.block_number().await {
                Ok(head) if head >= next => {
                    let end = head.min(next.saturating_add(self.config.batch_size - 1));
                    self.client
                        .get_logs(&self.filter(next, end))
                        .await
                        .map(|logs| Some((end, logs)))
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            };
            match step {
                Ok(Some((end, logs))) => {
                    errors = 0;
                    if !self.emit_logs(logs).await {
                        return Ok(());
                    }
                    next = end.saturating_add(1);
                    if end < u64::MAX {
                        continue;
                    }
                }
                Ok(None) => errors = 0,
                Err(e) => {
                    errors += 1;
                    self.check_error_budget(errors, &e)?;
                    tokio::time::sleep(self.error_backoff).await;
                    continue;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Runs an RPC call, retrying with backoff up to the error budget.
    async fn retrying<T, F, Fut>(&self, method: &str, mut call: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let mut errors = 0_u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    errors += 1;
                    warn!(stage = %self.name, method, attempt = errors, error = %e, "RPC call failed");
                    self.check_error_budget(errors, &e)?;
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }
    }

    fn check_error_budget(&self, errors: u32, error: &RpcError) -> Result<(), StageError> {
        if errors >= self.config.max_consecutive_errors.max(1) {
            return Err(StageError::new(
                &self.name,
                format!("giving up after {errors} consecutive RPC errors: {error}"),
            ));
        }
        debug!(stage = %self.name, errors, error = %error, "Backing off after RPC error");
        Ok(())
    }

    fn filter(&self, from_block: u64, to_block: u64) -> LogFilter {
        LogFilter {
            from_block,
            to_block,
            addresses: self.config.contract_address.into_iter().collect(),
            topic0: self.events.keys().copied().collect(),
        }
    }

    /// Decodes and emits logs; returns false once the executor stopped listening.
    async fn emit_logs(&self, logs: Vec<RawLog>) -> bool {
        for log in logs {
            let Some(record) = self.decode(&log) else {
                continue;
            };
            if !self.emitter.emit(record).await {
                debug!(stage = %self.name, "Record channel closed, stopping");
                return false;
            }
        }
        true
    }

    fn decode(&self, log: &RawLog) -> Option<Value> {
        let event = log.topics.first().and_then(|t| self.events.get(t))?;
        let args = match event.decode_log(&log.topics, &log.data) {
            Ok(args) => args,
            Err(e) => {
                warn!(
                    stage = %self.name,
                    event = %event.name,
                    block = log.block_number,
                    error = %e,
                    "Failed to decode log"
                );
                return None;
            }
        };
        if !self.passes_address_filters(&args) {
            return None;
        }
        Some(json!({
            "event_name": event.name,
            "contract_address": log.address.to_checksum(None),
            "transaction_hash": log.transaction_hash.map(|h| h.to_string()),
            "block_number": log.block_number,
            "log_index": log.log_index,
            "timestamp": Utc::now().to_rfc3339(),
            "chain": self.chain_label,
            "chain_id": self.chain_id,
            "args": args,
        }))
    }

    fn passes_address_filters(&self, args: &Map<String, Value>) -> bool {
        if self.config.address_filters.is_empty() {
            return true;
        }
        args.values().filter_map(Value::as_str).any(|value| {
            self.config
                .address_filters
                .iter()
                .any(|filter| filter.eq_ignore_ascii_case(value))
        })
    }
}

#[async_trait]
impl Stage for EventMonitorStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    async fn initialize(&mut self) -> Result<(), InitError> {
        let mut signatures = self.parsed_signatures.clone();
        if let Some(path) = &self.config.abi_path {
            let abi = Abi::load(path).map_err(|e| {
                InitError::new(&self.name, format!("cannot load ABI {}: {e}", path.display()))
            })?;
            signatures.extend(abi.events);
        }
        let wanted = &self.config.events_to_monitor;
        self.events = signatures
            .into_iter()
            .filter(|e| wanted.is_empty() || wanted.contains(&e.name))
            .map(|e| (e.topic0, e))
            .collect();
        if self.events.is_empty() {
            return Err(InitError::new(&self.name, "no events left to monitor"));
        }

        if self.chain_id.is_none() {
            let chain_id = self
                .client
                .chain_id()
                .await
                .map_err(|e| InitError::new(&self.name, format!("cannot read chain id: {e}")))?;
            self.chain_id = Some(chain_id);
        }
        info!(
            stage = %self.name,
            events = self.events.len(),
            chain_id = self.chain_id,
            mode = ?self.config.mode,
            "Event monitor ready"
        );
        Ok(())
    }

    async fn execute(&self, ctx: Context) -> Result<Context, StageError> {
        let _pulse = start_pulse(self.heartbeat.as_ref(), &ctx);
        match self.config.mode {
            MonitorMode::Historical => self.run_historical().await?,
            MonitorMode::Realtime => self.run_realtime().await?,
        }
        Ok(ctx)
    }
}

impl std::fmt::Debug for EventMonitorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMonitorStage")
            .field("name", &self.name)
            .field("mode", &self.config.mode)
            .field("chain", &self.chain_label)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}
