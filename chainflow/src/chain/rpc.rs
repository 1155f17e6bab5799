//! JSON-RPC chain client over HTTP.

use alloy_primitives::{Address, Bytes, B256, U64};
use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChainClient, LogFilter, RawLog, RpcError};

/// Retry behavior for transient RPC failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retrying).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Creates a config with `max_retries` and default delays.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Base delay before retry `attempt` (1-based), without jitter.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        Duration::from_millis(ms as u64).min(self.max_delay)
    }
}

/// A chain client speaking Ethereum JSON-RPC over HTTP.
#[derive(Debug)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    retry: RetryConfig,
}

impl JsonRpcClient {
    /// Creates a client for `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
            retry: RetryConfig::default(),
        })
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let mut attempt = 0;
        loop {
            let body = json!({
                "jsonrpc": "2.0",
                "id": self.next_id.fetch_add(1, Ordering::Relaxed),
                "method": method,
                "params": params,
            });
            match self.send_once(&body).await.and_then(parse_response) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let base = self.retry.delay_for_attempt(attempt);
                    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() / 4);
                    let delay = base + Duration::from_millis(u64::try_from(jitter).unwrap_or(0));
                    warn!(
                        method,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "RPC request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, body: &Value) -> Result<Value, RpcError> {
        let response = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Http(status.as_u16()));
        }
        response.json::<Value>().await.map_err(map_reqwest)
    }
}

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let id: U64 = self.request("eth_chainId", json!([])).await?;
        Ok(id.saturating_to())
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let number: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(number.saturating_to())
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        debug!(
            from_block = filter.from_block,
            to_block = filter.to_block,
            "eth_getLogs"
        );
        let logs: Vec<RpcLog> = self
            .request("eth_getLogs", json!([log_filter_params(filter)]))
            .await?;
        Ok(logs.into_iter().filter_map(RpcLog::into_raw).collect())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError> {
        self.request("eth_call", json!([{"to": to, "data": data}, "latest"]))
            .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<U64>,
    transaction_hash: Option<B256>,
    log_index: Option<U64>,
}

impl RpcLog {
    /// Pending logs carry no block number and are dropped.
    fn into_raw(self) -> Option<RawLog> {
        Some(RawLog {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: self.block_number?.saturating_to(),
            transaction_hash: self.transaction_hash,
            log_index: self.log_index.map(|i| i.saturating_to()),
        })
    }
}

fn log_filter_params(filter: &LogFilter) -> Value {
    let mut params = json!({
        "fromBlock": format!("{:#x}", filter.from_block),
        "toBlock": format!("{:#x}", filter.to_block),
    });
    if !filter.addresses.is_empty() {
        params["address"] = json!(filter.addresses);
    }
    if !filter.topic0.is_empty() {
        params["topics"] = json!([filter.topic0]);
    }
    params
}

fn parse_response<T: DeserializeOwned>(mut body: Value) -> Result<T, RpcError> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(RpcError::Node {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    let result = body
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| RpcError::InvalidResponse("missing result".to_string()))?;
    serde_json::from_value(result).map_err(|e| RpcError::InvalidResponse(e.to_string()))
}

fn map_reqwest(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout
    } else if e.is_decode() {
        RpcError::InvalidResponse(e.to_string())
    } else {
        RpcError::Transport(e.to_string())
    }
}
