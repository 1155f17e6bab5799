//! Contract read enrichment.
//!
//! Each configured caller performs one `eth_call` per record and merges the
//! decoded result into the payload under its method name. Call failures and
//! timeouts store `null` and never fail the stage.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::{seconds, Stage, StageDependencies};
use crate::chain::abi::{Abi, AbiError, FunctionSignature};
use crate::chain::{ChainClient, RpcError};
use crate::config::StageDescriptor;
use crate::context::{lookup_path, Context};
use crate::core::StageKind;
use crate::errors::{ConfigError, InitError, StageError};

/// Where a caller takes the contract address from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    /// `contract_address` from configuration.
    #[default]
    Static,
    /// A payload field named by `contract_address_field`.
    Dynamic,
}

fn default_address_field() -> String {
    "contract_address".to_string()
}

fn default_call_timeout() -> f64 {
    10.0
}

/// One contract call performed per record.
#[derive(Debug, Clone, Deserialize)]
pub struct CallerConfig {
    /// Only call for records with this event name.
    #[serde(default)]
    pub event_name: Option<String>,
    /// Named chain from the service settings.
    #[serde(default)]
    pub chain_name: Option<String>,
    /// Raw RPC endpoint, used when no chain name is given.
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Contract address for static callers.
    #[serde(default)]
    pub contract_address: Option<String>,
    /// Static or dynamic address.
    #[serde(default)]
    pub contract_address_source: AddressSource,
    /// Payload path holding the address for dynamic callers.
    #[serde(default = "default_address_field")]
    pub contract_address_field: String,
    /// Function to call; also the key the result is stored under.
    pub method_name: String,
    /// Arguments: strings are payload paths, other values literals.
    #[serde(default)]
    pub method_params: Vec<Value>,
    /// JSON ABI file containing the method.
    #[serde(default)]
    pub abi_path: Option<PathBuf>,
    /// Human-readable signature, e.g. `balanceOf(address)`.
    #[serde(default)]
    pub method_signature: Option<String>,
    /// Output types when the signature does not declare them.
    #[serde(default)]
    pub returns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MultiCallerConfig {
    contract_callers: Vec<CallerConfig>,
    #[serde(default = "default_call_timeout")]
    call_timeout: f64,
}

#[derive(Debug, Deserialize)]
struct TimeoutOnly {
    #[serde(default = "default_call_timeout")]
    call_timeout: f64,
}

#[derive(Debug, Error)]
enum CallError {
    #[error("no usable contract address: {0}")]
    Address(String),
    #[error("caller has no resolved method")]
    Unresolved,
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

enum Target {
    Static(Address),
    Dynamic(String),
}

struct Caller {
    config: CallerConfig,
    client: Arc<dyn ChainClient>,
    target: Target,
    function: Option<FunctionSignature>,
}

impl Caller {
    fn build(
        stage: &str,
        config: CallerConfig,
        deps: &StageDependencies,
    ) -> Result<Self, ConfigError> {
        if config.abi_path.is_none() && config.method_signature.is_none() {
            return Err(ConfigError::invalid_stage(
                stage,
                format!("caller '{}' needs abi_path or method_signature", config.method_name),
            ));
        }
        let target = match config.contract_address_source {
            AddressSource::Static => {
                let raw = config.contract_address.as_deref().ok_or_else(|| {
                    ConfigError::invalid_stage(stage, "static callers need contract_address")
                })?;
                Target::Static(raw.parse().map_err(|e| {
                    ConfigError::invalid_stage(stage, format!("invalid contract_address '{raw}': {e}"))
                })?)
            }
            AddressSource::Dynamic => Target::Dynamic(config.contract_address_field.clone()),
        };
        let function = config
            .method_signature
            .as_deref()
            .map(|sig| {
                let function = FunctionSignature::parse(sig)?;
                if config.returns.is_empty() {
                    Ok(function)
                } else {
                    function.with_output_types(&config.returns)
                }
            })
            .transpose()
            .map_err(|e| ConfigError::invalid_stage(stage, e.to_string()))?;
        let client =
            deps.chain_client(stage, config.chain_name.as_deref(), config.rpc_url.as_deref())?;
        Ok(Self {
            config,
            client,
            target,
            function,
        })
    }

    fn load_abi(&mut self, stage: &str) -> Result<(), InitError> {
        if self.function.is_some() {
            return Ok(());
        }
        let Some(path) = &self.config.abi_path else {
            return Ok(());
        };
        let abi = Abi::load(path).map_err(|e| {
            InitError::new(stage, format!("cannot load ABI {}: {e}", path.display()))
        })?;
        let function = abi.function(&self.config.method_name).cloned().ok_or_else(|| {
            InitError::new(
                stage,
                format!("method '{}' not found in {}", self.config.method_name, path.display()),
            )
        })?;
        self.function = Some(function);
        Ok(())
    }

    fn applies_to(&self, event_name: Option<&str>) -> bool {
        match (self.config.event_name.as_deref(), event_name) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }

    fn address(&self, payload: &Map<String, Value>) -> Result<Address, CallError> {
        match &self.target {
            Target::Static(address) => Ok(*address),
            Target::Dynamic(field) => {
                let raw = lookup_path(payload, field)
                    .and_then(Value::as_str)
                    .ok_or_else(|| CallError::Address(format!("field '{field}' is missing")))?;
                raw.parse()
                    .map_err(|e| CallError::Address(format!("'{raw}' in '{field}': {e}")))
            }
        }
    }

    fn arguments(&self, payload: &Map<String, Value>) -> Vec<Value> {
        self.config
            .method_params
            .iter()
            .map(|param| match param {
                Value::String(path) => lookup_path(payload, path).cloned().unwrap_or(Value::Null),
                literal => literal.clone(),
            })
            .collect()
    }

    async fn call(&self, payload: &Map<String, Value>) -> Result<Value, CallError> {
        let function = self
            .function
            .as_ref()
            .ok_or(CallError::Unresolved)?;
        let to = self.address(payload)?;
        let data = function.encode_call(&self.arguments(payload))?;
        let output = self.client.call(to, data).await?;
        Ok(function.decode_output(&output)?)
    }
}

/// Enrichment stage reading contract state for each record.
pub struct ContractCallerStage {
    name: String,
    callers: Vec<Caller>,
    call_timeout: Duration,
}

impl ContractCallerStage {
    /// Builds the stage from `contract_callers` or a single flat caller.
    pub fn from_descriptor(
        descriptor: &StageDescriptor,
        deps: &StageDependencies,
    ) -> Result<Self, ConfigError> {
        let name = descriptor.name.clone();
        let (configs, timeout) = if descriptor.config.contains_key("contract_callers") {
            let multi: MultiCallerConfig = descriptor.parse_config()?;
            (multi.contract_callers, multi.call_timeout)
        } else {
            let single: CallerConfig = descriptor.parse_config()?;
            let timeout: TimeoutOnly = descriptor.parse_config()?;
            (vec![single], timeout.call_timeout)
        };
        if configs.is_empty() {
            return Err(ConfigError::invalid_stage(&name, "contract_callers is empty"));
        }
        let callers = configs
            .into_iter()
            .map(|config| Caller::build(&name, config, deps))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            call_timeout: seconds(&name, "call_timeout", timeout)?,
            name,
            callers,
        })
    }
}

#[async_trait]
impl Stage for ContractCallerStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Enrichment
    }

    async fn initialize(&mut self) -> Result<(), InitError> {
        for caller in &mut self.callers {
            caller.load_abi(&self.name)?;
        }
        Ok(())
    }

    async fn execute(&self, mut ctx: Context) -> Result<Context, StageError> {
        let event_name = ctx.event_name().map(str::to_string);
        let mut results: Vec<(String, Vec<Value>)> = Vec::new();

        for caller in self.callers.iter().filter(|c| c.applies_to(event_name.as_deref())) {
            let method = &caller.config.method_name;
            let call = tokio::time::timeout(self.call_timeout, caller.call(&ctx.payload));
            let value = match call.await {
                Ok(Ok(value)) => {
                    debug!(stage = %self.name, method = %method, "Contract call succeeded");
                    value
                }
                Ok(Err(e)) => {
                    warn!(stage = %self.name, method = %method, error = %e, "Contract call failed");
                    Value::Null
                }
                Err(_) => {
                    warn!(
                        stage = %self.name,
                        method = %method,
                        timeout_ms = u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Contract call timed out"
                    );
                    Value::Null
                }
            };
            match results.iter_mut().find(|(key, _)| key == method) {
                Some((_, values)) => values.push(value),
                None => results.push((method.clone(), vec![value])),
            }
        }

        for (key, mut values) in results {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            ctx.payload.insert(key, value);
        }
        Ok(ctx)
    }
}

impl std::fmt::Debug for ContractCallerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let methods: Vec<_> = self.callers.iter().map(|c| &c.config.method_name).collect();
        f.debug_struct("ContractCallerStage")
            .field("name", &self.name)
            .field("methods", &methods)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use alloy_dyn_abi::DynSolValue;
    use alloy_primitives::{address, Bytes, U256};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    const TOKEN: Address = address!("a0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");

    fn uint_word(value: u64) -> Bytes {
        Bytes::from(DynSolValue::Uint(U256::from(value), 256).abi_encode())
    }

    fn build(client: MockChainClient, config: Value) -> Result<ContractCallerStage, ConfigError> {
        let deps = StageDependencies::new().with_chain("local", Arc::new(client));
        ContractCallerStage::from_descriptor(
            &StageDescriptor::new("caller", "contract_caller", config),
            &deps,
        )
    }

    #[tokio::test]
    async fn test_legacy_single_caller_merges_result() {
        let mut client = MockChainClient::new();
        client
            .expect_call()
            .withf(|to, data| *to == TOKEN && data.len() == 36)
            .returning(|_, _| Ok(uint_word(900)));

        let mut stage = build(
            client,
            json!({
                "chain_name": "local",
                "contract_address": TOKEN.to_string(),
                "method_name": "balanceOf",
                "method_signature": "balanceOf(address) returns (uint256)",
                "method_params": ["args.to"]
            }),
        )
        .unwrap();
        stage.initialize().await.unwrap();

        let ctx = Context::from_value(
            "p",
            json!({"event_name": "Transfer", "args": {"to": "0x00000000000000000000000000000000000000b0"}}),
        );
        let out = stage.execute(ctx).await.unwrap();
        assert_eq!(out.payload["balanceOf"], json!(900));
    }

    #[tokio::test]
    async fn test_failed_call_stores_null() {
        let mut client = MockChainClient::new();
        client.expect_call().returning(|_, _| {
            Err(RpcError::Node {
                code: 3,
                message: "execution reverted".to_string(),
            })
        });

        let mut stage = build(
            client,
            json!({
                "chain_name": "local",
                "contract_address": TOKEN.to_string(),
                "method_name": "totalSupply",
                "method_signature": "totalSupply()",
                "returns": ["uint256"]
            }),
        )
        .unwrap();
        stage.initialize().await.unwrap();

        let out = stage
            .execute(Context::from_value("p", json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(out.payload["totalSupply"], Value::Null);
        assert_eq!(out.payload["n"], json!(1));
    }

    #[tokio::test]
    async fn test_event_filter_and_repeated_methods() {
        let mut client = MockChainClient::new();
        client
            .expect_call()
            .times(2)
            .returning(|to, _| Ok(uint_word(if to == TOKEN { 1 } else { 2 })));

        let mut stage = build(
            client,
            json!({
                "call_timeout": 5,
                "contract_callers": [
                    {"chain_name": "local", "contract_address": TOKEN.to_string(),
                     "method_name": "decimals", "method_signature": "decimals() returns (uint8)"},
                    {"chain_name": "local", "contract_address_source": "dynamic",
                     "contract_address_field": "args.pool",
                     "method_name": "decimals", "method_signature": "decimals() returns (uint8)"},
                    {"event_name": "Approval", "chain_name": "local",
                     "contract_address": TOKEN.to_string(),
                     "method_name": "owner", "method_signature": "owner() returns (address)"}
                ]
            }),
        )
        .unwrap();
        stage.initialize().await.unwrap();

        let ctx = Context::from_value(
            "p",
            json!({"event_name": "Transfer", "args": {"pool": "0x00000000000000000000000000000000000000cc"}}),
        );
        let out = stage.execute(ctx).await.unwrap();
        assert_eq!(out.payload["decimals"], json!([1, 2]));
        assert!(!out.payload.contains_key("owner"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_to_null() {
        let mut client = MockChainClient::new();
        client.expect_call().returning(|_, _| Ok(uint_word(1)));
        let slow = SlowClient(client);

        let deps = StageDependencies::new().with_chain("local", Arc::new(slow));
        let mut stage = ContractCallerStage::from_descriptor(
            &StageDescriptor::new(
                "caller",
                "contract_caller",
                json!({
                    "chain_name": "local",
                    "contract_address": TOKEN.to_string(),
                    "method_name": "decimals",
                    "method_signature": "decimals() returns (uint8)",
                    "call_timeout": 0.5
                }),
            ),
            &deps,
        )
        .unwrap();
        stage.initialize().await.unwrap();

        let out = stage
            .execute(Context::from_value("p", json!({})))
            .await
            .unwrap();
        assert_eq!(out.payload["decimals"], Value::Null);
    }

    struct SlowClient(MockChainClient);

    #[async_trait]
    impl ChainClient for SlowClient {
        async fn chain_id(&self) -> Result<u64, RpcError> {
            self.0.chain_id().await
        }

        async fn block_number(&self) -> Result<u64, RpcError> {
            self.0.block_number().await
        }

        async fn get_logs(
            &self,
            filter: &crate::chain::LogFilter,
        ) -> Result<Vec<crate::chain::RawLog>, RpcError> {
            self.0.get_logs(filter).await
        }

        async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.0.call(to, data).await
        }
    }

    #[tokio::test]
    async fn test_method_resolved_from_abi_file() {
        let mut abi = tempfile::NamedTempFile::new().unwrap();
        write!(
            abi,
            r#"[{{"type":"function","name":"symbol","inputs":[],"outputs":[{{"name":"","type":"string"}}]}}]"#
        )
        .unwrap();

        let mut client = MockChainClient::new();
        client.expect_call().returning(|_, _| {
            Ok(Bytes::from(
                DynSolValue::Tuple(vec![DynSolValue::String("USDC".into())]).abi_encode_params(),
            ))
        });
        let mut stage = build(
            client,
            json!({
                "chain_name": "local",
                "contract_address": TOKEN.to_string(),
                "method_name": "symbol",
                "abi_path": abi.path()
            }),
        )
        .unwrap();
        stage.initialize().await.unwrap();

        let out = stage
            .execute(Context::from_value("p", json!({})))
            .await
            .unwrap();
        assert_eq!(out.payload["symbol"], json!("USDC"));
    }

    #[test]
    fn test_config_errors() {
        let missing_abi = build(
            MockChainClient::new(),
            json!({"chain_name": "local", "contract_address": TOKEN.to_string(), "method_name": "x"}),
        );
        assert!(matches!(missing_abi, Err(ConfigError::InvalidStageConfig { .. })));

        let bad_address = build(
            MockChainClient::new(),
            json!({"chain_name": "local", "contract_address": "0x12", "method_name": "x",
                   "method_signature": "x()"}),
        );
        assert!(matches!(bad_address, Err(ConfigError::InvalidStageConfig { .. })));
    }
}
