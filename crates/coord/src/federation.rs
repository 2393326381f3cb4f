//! Query federation across every healthy node.
//!
//! One task per target node, each under the per-node timeout, joined against
//! a global deadline. Tasks still running at the deadline are aborted and
//! their nodes reported as failed; the call itself still returns whatever
//! arrived in time.

use crate::node_client::{NodeClient, NodeError};
use catalogue_common::NodeAddr;
use catalogue_ring::NodeRegistry;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FederationError {
    #[error("no healthy nodes to query")]
    NoHealthyNodes,
    #[error("all {attempted} node(s) failed to answer")]
    AllNodesFailed {
        attempted: usize,
        failed_nodes: Vec<NodeAddr>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedResult {
    /// Union of all rows returned, first occurrence wins.
    pub results: Vec<Value>,
    pub failed_nodes: Vec<NodeAddr>,
    pub responded_nodes: Vec<NodeAddr>,
}

pub struct QueryFederator<C: NodeClient> {
    registry: Arc<NodeRegistry>,
    client: Arc<C>,
    node_timeout: Duration,
    deadline: Duration,
}

impl<C: NodeClient> std::fmt::Debug for QueryFederator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryFederator")
            .field("node_timeout", &self.node_timeout)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> QueryFederator<C> {
    pub fn new(registry: Arc<NodeRegistry>, client: Arc<C>, node_timeout: Duration, deadline: Duration) -> Self {
        Self {
            registry,
            client,
            node_timeout,
            deadline,
        }
    }

    pub async fn federate(&self, query: &str) -> Result<FederatedResult, FederationError> {
        let m = catalogue_metrics::metrics();
        m.federated_queries.inc();
        let _timer = m.query_latency_secs.start_timer();

        let targets = self.registry.snapshot().healthy_nodes();
        if targets.is_empty() {
            return Err(FederationError::NoHealthyNodes);
        }

        let deadline = Instant::now() + self.deadline;
        let query: Arc<str> = Arc::from(query);
        let mut futs = FuturesUnordered::new();
        let mut aborts = Vec::with_capacity(targets.len());

        for (idx, node) in targets.iter().cloned().enumerate() {
            let client = self.client.clone();
            let query = query.clone();
            let node_timeout = self.node_timeout;
            let handle = tokio::spawn(async move {
                let result = match tokio::time::timeout(node_timeout, client.query(&node, &query)).await {
                    Ok(r) => r,
                    Err(_) => Err(NodeError::Timeout),
                };
                (idx, result)
            });
            aborts.push(handle.abort_handle());
            futs.push(handle);
        }

        let mut answers: Vec<Option<Result<Vec<Value>, NodeError>>> = vec![None; targets.len()];
        while let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
            .await
            .ok()
            .flatten()
        {
            match joined {
                Ok((idx, result)) => answers[idx] = Some(result),
                Err(e) => tracing::warn!("federated query task failed: {}", e),
            }
        }
        for handle in &aborts {
            handle.abort();
        }

        let mut merged = FederatedResult::default();
        let mut seen = HashSet::new();
        for (node, answer) in targets.into_iter().zip(answers) {
            match answer {
                Some(Ok(rows)) => {
                    for row in rows {
                        if seen.insert(row.to_string()) {
                            merged.results.push(row);
                        }
                    }
                    merged.responded_nodes.push(node);
                }
                Some(Err(e)) => {
                    tracing::debug!("query on {} failed: {}", node, e);
                    merged.failed_nodes.push(node);
                }
                None => {
                    tracing::debug!("query on {} cancelled at deadline", node);
                    merged.failed_nodes.push(node);
                }
            }
        }

        m.federation_node_failures.inc_by(merged.failed_nodes.len() as u64);
        if merged.responded_nodes.is_empty() {
            return Err(FederationError::AllNodesFailed {
                attempted: merged.failed_nodes.len(),
                failed_nodes: merged.failed_nodes,
            });
        }
        if !merged.failed_nodes.is_empty() {
            tracing::warn!(
                "federated query: {}/{} node(s) failed: {:?}",
                merged.failed_nodes.len(),
                merged.failed_nodes.len() + merged.responded_nodes.len(),
                merged.failed_nodes
            );
        }
        Ok(merged)
    }
}
