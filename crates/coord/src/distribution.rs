//! Distribution engine: places offerings on the ring and pushes them out.
//!
//! For each offering:
//! 1. Cache its content in the state store (failover re-pushes read it back)
//! 2. Look up `replicas` distinct nodes on the current ring snapshot
//! 3. Push to every target concurrently, each with bounded retries
//! 4. Record the assignment with the nodes that acknowledged
//!
//! An offering nobody acknowledged is an error, never a silent drop.

use crate::node_client::{NodeClient, NodeError};
use crate::offering::{Offering, ReplicaAssignment};
use crate::pool::{PoolError, WorkerPool};
use crate::retry::RetryPolicy;
use crate::store::{self, StateStore, StoreError};
use catalogue_common::NodeAddr;
use catalogue_ring::NodeRegistry;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("no available nodes for offering {offering_id}")]
    NoAvailableNodes { offering_id: String },
    #[error("all {} push(es) failed for offering {offering_id}", .failed_nodes.len())]
    AllPushesFailed {
        offering_id: String,
        failed_nodes: Vec<NodeAddr>,
    },
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),
}

/// Outcome of distributing one offering.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub offering_id: String,
    pub assignment: ReplicaAssignment,
    /// Targets that never acknowledged, after retries.
    pub failed_nodes: Vec<NodeAddr>,
}

impl DistributionReport {
    pub fn under_replicated(&self) -> bool {
        self.assignment.under_replicated
    }
}

/// Outcome of a batch submitted through the worker pool.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub distributed: usize,
    pub under_replicated: usize,
    /// `(offering_id, reason)` for every offering that could not be placed.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DistributionOptions {
    pub replicas: usize,
    pub retry: RetryPolicy,
    /// Upper bound on a single push attempt.
    pub push_timeout: Duration,
}

impl Default for DistributionOptions {
    fn default() -> Self {
        Self {
            replicas: 2,
            retry: RetryPolicy::default(),
            push_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DistributionEngine<C: NodeClient> {
    registry: Arc<NodeRegistry>,
    client: Arc<C>,
    store: Arc<dyn StateStore>,
    options: DistributionOptions,
}

impl<C: NodeClient> std::fmt::Debug for DistributionEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> DistributionEngine<C> {
    pub fn new(
        registry: Arc<NodeRegistry>,
        client: Arc<C>,
        store: Arc<dyn StateStore>,
        options: DistributionOptions,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn replicas(&self) -> usize {
        self.options.replicas
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.options.retry
    }

    /// Place one offering and push it to its replica set.
    pub async fn distribute(&self, offering: Offering) -> Result<DistributionReport, DistributionError> {
        let m = catalogue_metrics::metrics();
        store::put_json(self.store.as_ref(), &store::offering_key(&offering.id), &offering).await?;

        let snapshot = self.registry.snapshot();
        let ring_version = snapshot.ring_version();
        let targets = snapshot.lookup(&offering.id, self.options.replicas);
        if targets.is_empty() {
            m.offerings_failed.inc();
            tracing::warn!("offering {}: no nodes on ring v{}", offering.id, ring_version);
            return Err(DistributionError::NoAvailableNodes {
                offering_id: offering.id,
            });
        }

        let mut acked = Vec::with_capacity(targets.len());
        let mut failed_nodes = Vec::new();
        for (node, result) in self.push_all(&targets, &offering).await {
            match result {
                Ok(()) => acked.push(node),
                Err(e) => {
                    tracing::warn!("offering {}: push to {} failed: {}", offering.id, node, e);
                    failed_nodes.push(node);
                }
            }
        }

        if acked.is_empty() {
            m.offerings_failed.inc();
            return Err(DistributionError::AllPushesFailed {
                offering_id: offering.id,
                failed_nodes,
            });
        }

        let assignment =
            ReplicaAssignment::new(offering.id.clone(), acked, ring_version, self.options.replicas);
        self.save_assignment(&assignment).await?;
        m.offerings_distributed.inc();
        tracing::debug!(
            "offering {} placed on {:?} (ring v{})",
            offering.id,
            assignment.nodes,
            ring_version
        );

        Ok(DistributionReport {
            offering_id: offering.id,
            assignment,
            failed_nodes,
        })
    }

    /// Distribute every offering through `pool`, one job per offering.
    pub async fn distribute_batch(self: &Arc<Self>, pool: &WorkerPool, offerings: Vec<Offering>) -> BatchReport {
        let ids: Vec<String> = offerings.iter().map(|o| o.id.clone()).collect();
        let jobs = offerings.into_iter().map(|offering| {
            let engine = Arc::clone(self);
            async move { engine.distribute(offering).await }
        });

        let mut report = BatchReport::default();
        for (id, result) in ids.into_iter().zip(pool.run_all(jobs).await) {
            match result.map_err(DistributionError::from).and_then(|r| r) {
                Ok(r) => {
                    report.distributed += 1;
                    if r.under_replicated() {
                        report.under_replicated += 1;
                    }
                }
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }

        tracing::info!(
            "distribution batch: {} distributed ({} under-replicated), {} failed",
            report.distributed,
            report.under_replicated,
            report.failed.len()
        );
        report
    }

    /// Push one offering to one node, retrying transient failures.
    pub async fn push_with_retry(&self, node: &NodeAddr, offering: &Offering) -> Result<(), NodeError> {
        let m = catalogue_metrics::metrics();
        let timeout = self.options.push_timeout;
        let result = self
            .options
            .retry
            .run(|attempt| async move {
                if attempt > 1 {
                    m.push_retries.inc();
                }
                m.pushes_total.inc();
                let _timer = m.push_latency_secs.start_timer();
                match tokio::time::timeout(timeout, self.client.push(node, offering)).await {
                    Ok(r) => r,
                    Err(_) => Err(NodeError::Timeout),
                }
            })
            .await;
        if result.is_err() {
            m.pushes_failed.inc();
        }
        result
    }

    /// Push to all `nodes` concurrently. Results come back in `nodes` order.
    pub async fn push_all(
        &self,
        nodes: &[NodeAddr],
        offering: &Offering,
    ) -> Vec<(NodeAddr, Result<(), NodeError>)> {
        let pushes = nodes.iter().map(|node| async move {
            let result = self.push_with_retry(node, offering).await;
            (node.clone(), result)
        });
        futures::future::join_all(pushes).await
    }

    /// Stored assignment for an offering, if it was ever placed.
    pub async fn placement(&self, offering_id: &str) -> Result<Option<ReplicaAssignment>, StoreError> {
        store::get_json(self.store.as_ref(), &store::assignment_key(offering_id)).await
    }

    pub async fn cached_offering(&self, offering_id: &str) -> Result<Option<Offering>, StoreError> {
        store::get_json(self.store.as_ref(), &store::offering_key(offering_id)).await
    }

    /// Every stored assignment, ordered by key.
    pub async fn load_assignments(&self) -> Result<Vec<ReplicaAssignment>, StoreError> {
        let keys = self.store.keys_with_prefix(store::ASSIGNMENT_PREFIX).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match store::get_json::<ReplicaAssignment>(self.store.as_ref(), &key).await {
                Ok(Some(a)) => out.push(a),
                Ok(None) => {}
                Err(StoreError::Serde(e)) => {
                    tracing::warn!("skipping unreadable assignment {}: {}", key, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn save_assignment(&self, assignment: &ReplicaAssignment) -> Result<(), StoreError> {
        if assignment.under_replicated {
            catalogue_metrics::metrics().under_replicated.inc();
            tracing::warn!(
                "offering {} under-replicated: {}/{} node(s) on ring v{}",
                assignment.offering_id,
                assignment.nodes.len(),
                assignment.target_replicas,
                assignment.ring_version
            );
        }
        store::put_json(
            self.store.as_ref(),
            &store::assignment_key(&assignment.offering_id),
            assignment,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use catalogue_common::HealthState;
    use serde_json::Value;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Records pushes; scripted nodes fail a fixed number of times first.
    #[derive(Default)]
    struct RecordingClient {
        stored: Mutex<HashMap<(NodeAddr, String), Vec<u8>>>,
        pushes: Mutex<Vec<NodeAddr>>,
        dead: Mutex<HashSet<NodeAddr>>,
        flaky: Mutex<HashMap<NodeAddr, u32>>,
    }

    #[async_trait::async_trait]
    impl NodeClient for RecordingClient {
        async fn probe(&self, _node: &NodeAddr) -> Result<(), NodeError> {
            Ok(())
        }

        async fn push(&self, node: &NodeAddr, offering: &Offering) -> Result<(), NodeError> {
            self.pushes.lock().unwrap().push(node.clone());
            if self.dead.lock().unwrap().contains(node) {
                return Err(NodeError::Unreachable("dead".into()));
            }
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(node) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(NodeError::Status(503));
                    }
                }
            }
            self.stored
                .lock()
                .unwrap()
                .insert((node.clone(), offering.id.clone()), offering.content.clone());
            Ok(())
        }

        async fn query(&self, _node: &NodeAddr, _query: &str) -> Result<Vec<Value>, NodeError> {
            Ok(vec![])
        }
    }

    fn addr(i: usize) -> NodeAddr {
        NodeAddr::new(format!("http://node-{}:3030", i))
    }

    fn engine(nodes: usize, replicas: usize) -> (Arc<DistributionEngine<RecordingClient>>, Arc<RecordingClient>) {
        let registry = Arc::new(NodeRegistry::new(32, HealthState::Healthy));
        for i in 1..=nodes {
            registry.register(addr(i));
        }
        let client = Arc::new(RecordingClient::default());
        let options = DistributionOptions {
            replicas,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                jitter: Duration::ZERO,
            },
            push_timeout: Duration::from_secs(1),
        };
        let engine = DistributionEngine::new(registry, client.clone(), Arc::new(MemoryStore::new()), options);
        (Arc::new(engine), client)
    }

    #[tokio::test]
    async fn test_distribute_places_on_ring_lookup() {
        let (engine, client) = engine(3, 2);
        let report = engine.distribute(Offering::new("o1", b"{}".to_vec())).await.unwrap();

        let expected = engine.registry().snapshot().lookup("o1", 2);
        assert_eq!(report.assignment.nodes, expected);
        assert!(!report.under_replicated());
        assert!(report.failed_nodes.is_empty());
        assert_eq!(client.stored.lock().unwrap().len(), 2);

        let stored = engine.placement("o1").await.unwrap().unwrap();
        assert_eq!(stored, report.assignment);
        assert!(engine.cached_offering("o1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fewer_nodes_than_replicas_is_degraded() {
        let (engine, _client) = engine(1, 3);
        let report = engine.distribute(Offering::new("o1", b"x".to_vec())).await.unwrap();
        assert_eq!(report.assignment.nodes, vec![addr(1)]);
        assert!(report.under_replicated());
        assert_eq!(report.assignment.target_replicas, 3);
    }

    #[tokio::test]
    async fn test_empty_ring_is_fatal() {
        let (engine, _client) = engine(0, 2);
        let err = engine.distribute(Offering::new("o1", b"x".to_vec())).await.unwrap_err();
        assert!(matches!(err, DistributionError::NoAvailableNodes { .. }));
        assert!(engine.placement("o1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_pushes_failing_records_nothing() {
        tokio::time::pause();
        let (engine, client) = engine(2, 2);
        client.dead.lock().unwrap().extend([addr(1), addr(2)]);

        let err = engine.distribute(Offering::new("o1", b"x".to_vec())).await.unwrap_err();
        match err {
            DistributionError::AllPushesFailed { offering_id, failed_nodes } => {
                assert_eq!(offering_id, "o1");
                assert_eq!(failed_nodes.len(), 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(engine.placement("o1").await.unwrap().is_none());
        // 3 attempts per node
        assert_eq!(client.pushes.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_partial_push_failure_keeps_acknowledged_nodes() {
        tokio::time::pause();
        let (engine, client) = engine(3, 2);
        let targets = engine.registry().snapshot().lookup("o1", 2);
        client.dead.lock().unwrap().insert(targets[0].clone());

        let report = engine.distribute(Offering::new("o1", b"x".to_vec())).await.unwrap();
        assert_eq!(report.assignment.nodes, vec![targets[1].clone()]);
        assert_eq!(report.failed_nodes, vec![targets[0].clone()]);
        assert!(report.under_replicated());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        tokio::time::pause();
        let (engine, client) = engine(1, 1);
        client.flaky.lock().unwrap().insert(addr(1), 2);

        let report = engine.distribute(Offering::new("o1", b"x".to_vec())).await.unwrap();
        assert_eq!(report.assignment.nodes, vec![addr(1)]);
        assert_eq!(client.pushes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_redistribute_is_idempotent() {
        let (engine, client) = engine(3, 2);
        let offering = Offering::new("o1", b"payload".to_vec());
        engine.distribute(offering.clone()).await.unwrap();
        let first = client.stored.lock().unwrap().clone();
        engine.distribute(offering).await.unwrap();
        assert_eq!(*client.stored.lock().unwrap(), first);
    }

    #[tokio::test]
    async fn test_batch_through_pool() {
        let (engine, _client) = engine(3, 2);
        let pool = WorkerPool::new(2);
        let offerings = (0..10)
            .map(|i| Offering::new(format!("o{}", i), b"x".to_vec()))
            .collect();
        let report = engine.distribute_batch(&pool, offerings).await;
        assert_eq!(report.distributed, 10);
        assert!(report.failed.is_empty());
        assert_eq!(engine.load_assignments().await.unwrap().len(), 10);
    }
}
