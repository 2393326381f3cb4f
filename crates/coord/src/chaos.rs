//! Chaos injection wrapper for [`NodeClient`].
//!
//! [`ChaosNodeClient`] wraps any `C: NodeClient` and injects configurable
//! failures: random errors, per-node failures, per-node hangs and latency.

use crate::node_client::{NodeClient, NodeError};
use crate::offering::Offering;
use catalogue_common::NodeAddr;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Configuration for chaos injection.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    /// Probability of returning an error \[0.0, 1.0\].
    pub failure_rate: f64,
    /// Fixed latency injected before forwarding.
    pub latency: Duration,
    /// Random additional latency in \[0, jitter\].
    pub jitter: Duration,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }
}

/// A [`NodeClient`] wrapper that injects failures, latency and hangs.
pub struct ChaosNodeClient<C: NodeClient> {
    inner: Arc<C>,
    config: Arc<RwLock<ChaosConfig>>,
    /// Nodes that answer every call with an error.
    failed_nodes: Arc<RwLock<HashSet<NodeAddr>>>,
    /// Nodes that never answer.
    hung_nodes: Arc<RwLock<HashSet<NodeAddr>>>,
}

impl<C: NodeClient> std::fmt::Debug for ChaosNodeClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosNodeClient").finish_non_exhaustive()
    }
}

impl<C: NodeClient> ChaosNodeClient<C> {
    pub fn new(inner: C, config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(inner),
            config: Arc::new(RwLock::new(config)),
            failed_nodes: Arc::new(RwLock::new(HashSet::new())),
            hung_nodes: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    /// Mark a node as failed (until recovered).
    pub async fn fail_node(&self, node: NodeAddr) {
        self.failed_nodes.write().await.insert(node);
    }

    /// Make a node hang on every call (until recovered).
    pub async fn hang_node(&self, node: NodeAddr) {
        self.hung_nodes.write().await.insert(node);
    }

    /// Clear both the failed and hung marks for a node.
    pub async fn recover_node(&self, node: &NodeAddr) {
        self.failed_nodes.write().await.remove(node);
        self.hung_nodes.write().await.remove(node);
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.config.write().await.failure_rate = rate;
    }

    /// Apply chaos checks: returns Err if the call should fail.
    async fn maybe_fail(&self, node: &NodeAddr) -> Result<(), NodeError> {
        let hung = self.hung_nodes.read().await.contains(node);
        if hung {
            std::future::pending::<()>().await;
        }
        if self.failed_nodes.read().await.contains(node) {
            return Err(NodeError::Unreachable("chaos: node marked as failed".into()));
        }

        let (delay, failure_rate) = {
            let config = self.config.read().await;
            let jitter_ms = if config.jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64)
            };
            (config.latency + Duration::from_millis(jitter_ms), config.failure_rate)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if failure_rate > 0.0 && rand::thread_rng().gen_bool(failure_rate.min(1.0)) {
            return Err(NodeError::Unreachable("chaos: random failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<C: NodeClient> NodeClient for ChaosNodeClient<C> {
    async fn probe(&self, node: &NodeAddr) -> Result<(), NodeError> {
        self.maybe_fail(node).await?;
        self.inner.probe(node).await
    }

    async fn push(&self, node: &NodeAddr, offering: &Offering) -> Result<(), NodeError> {
        self.maybe_fail(node).await?;
        self.inner.push(node, offering).await
    }

    async fn query(&self, node: &NodeAddr, query: &str) -> Result<Vec<Value>, NodeError> {
        self.maybe_fail(node).await?;
        self.inner.query(node, query).await
    }
}

// ────────────────────────── Tests ──────────────────────────
