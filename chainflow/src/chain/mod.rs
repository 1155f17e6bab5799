//! EVM chain access.
//!
//! - [`ChainClient`]: the seam stages use to read logs and call contracts
//! - [`abi`]: event and function signatures, log decoding, call encoding
//! - [`JsonRpcClient`]: a JSON-RPC implementation over HTTP

pub mod abi;
#[cfg(feature = "rpc")]
mod rpc;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "rpc")]
pub use rpc::{JsonRpcClient, RetryConfig};

/// Errors from talking to a chain node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The request never got a response.
    #[error("RPC transport error: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success HTTP status.
    #[error("RPC HTTP status {0}")]
    Http(u16),

    /// The node returned a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Node {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),

    /// The request took longer than allowed.
    #[error("RPC request timed out")]
    Timeout,
}

impl RpcError {
    /// Returns true if the failure is likely transient.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Http(status) => *status == 429 || *status >= 500,
            Self::Node { message, .. } => {
                let msg = message.to_lowercase();
                msg.contains("rate limit")
                    || msg.contains("too many requests")
                    || msg.contains("timeout")
                    || msg.contains("try again")
                    || msg.contains("temporarily")
            }
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Block range and contract filter for `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    /// First block, inclusive.
    pub from_block: u64,
    /// Last block, inclusive.
    pub to_block: u64,
    /// Emitting contracts; empty means any.
    pub addresses: Vec<Address>,
    /// Accepted `topic0` values; empty means any.
    pub topic0: Vec<B256>,
}

/// A raw log entry as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// Emitting contract.
    pub address: Address,
    /// Topics, `topic0` first.
    pub topics: Vec<B256>,
    /// Non-indexed data.
    pub data: Bytes,
    /// Block containing the log.
    pub block_number: u64,
    /// Transaction hash.
    pub transaction_hash: Option<B256>,
    /// Position within the block.
    pub log_index: Option<u64>,
}

/// Read access to an EVM chain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The chain id reported by the node.
    async fn chain_id(&self) -> Result<u64, RpcError>;

    /// The latest block number.
    async fn block_number(&self) -> Result<u64, RpcError>;

    /// Logs matching a filter.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError>;

    /// Executes a read-only call against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RpcError::Transport("connection reset".into()).is_retryable());
        assert!(RpcError::Timeout.is_retryable());
        assert!(RpcError::Http(503).is_retryable());
        assert!(RpcError::Http(429).is_retryable());
        assert!(!RpcError::Http(404).is_retryable());
        assert!(RpcError::Node {
            code: -32005,
            message: "Rate limit exceeded".into()
        }
        .is_retryable());
        assert!(!RpcError::Node {
            code: -32000,
            message: "execution reverted".into()
        }
        .is_retryable());
        assert!(!RpcError::InvalidResponse("bad hex".into()).is_retryable());
    }
}
