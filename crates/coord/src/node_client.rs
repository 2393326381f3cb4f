//! Abstraction over calls to catalogue nodes.
//!
//! The HTTP implementation lives in `catalogue-net::client`.

use crate::offering::Offering;
use catalogue_common::NodeAddr;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("node unreachable: {0}")]
    Unreachable(String),
    #[error("node returned HTTP {0}")]
    Status(u16),
    #[error("timeout")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl NodeError {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Unreachable(_) | NodeError::Timeout => true,
            NodeError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            NodeError::InvalidResponse(_) => false,
        }
    }
}

/// Node-side contract: liveness probe, idempotent push, query.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Liveness check. `Ok` means the node answered with success.
    async fn probe(&self, node: &NodeAddr) -> Result<(), NodeError>;

    /// Upsert an offering's content on a node, keyed by offering id.
    async fn push(&self, node: &NodeAddr, offering: &Offering) -> Result<(), NodeError>;

    /// Run an opaque query on a node and return its result rows.
    async fn query(&self, node: &NodeAddr, query: &str) -> Result<Vec<Value>, NodeError>;
}
