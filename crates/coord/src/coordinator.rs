//! Top-level wiring: one registry, one pool, one store, and the components
//! built on them.
//!
//! ```text
//!  feed poller ──offerings──▶ DistributionEngine ──pushes──▶ WorkerPool
//!                                     ▲                          ▲
//!  HealthMonitor ──events──▶ FailoverCoordinator ────────────────┘
//!        │
//!        └──set health──▶ NodeRegistry ◀──snapshots── QueryFederator
//! ```

use crate::distribution::{DistributionEngine, DistributionError, DistributionOptions, DistributionReport};
use crate::failover::FailoverCoordinator;
use crate::federation::{FederatedResult, FederationError, QueryFederator};
use crate::feed::{FeedPoller, RegistryFeed};
use crate::health::{HealthEvent, HealthMonitor, HealthMonitorConfig, EVENT_QUEUE_CAPACITY};
use crate::node_client::NodeClient;
use crate::offering::{Offering, ReplicaAssignment};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::store::{EngineStore, MemoryStore, StateStore, StoreError};
use catalogue_common::NodeAddr;
use catalogue_config::{CoordinatorConfig, DiscoveryMode, PersistenceBackend, PersistenceConfig};
use catalogue_ring::NodeRegistry;
use catalogue_storage::FsyncPolicy;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Open the configured persistence backend, falling back to memory when the
/// durable one cannot be opened.
pub fn open_store(config: &PersistenceConfig) -> Arc<dyn StateStore> {
    match config.backend {
        PersistenceBackend::Memory => Arc::new(MemoryStore::new()),
        PersistenceBackend::Wal => {
            let fsync = FsyncPolicy::from_str_config(&config.fsync);
            match EngineStore::open(&config.data_dir, fsync) {
                Ok(store) => {
                    tracing::info!("state store: wal at {}", config.data_dir.display());
                    Arc::new(store)
                }
                Err(e) => {
                    tracing::warn!(
                        "could not open wal store at {}: {}; falling back to memory",
                        config.data_dir.display(),
                        e
                    );
                    Arc::new(MemoryStore::new())
                }
            }
        }
    }
}

pub struct Coordinator<C: NodeClient> {
    config: CoordinatorConfig,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn StateStore>,
    pool: Arc<WorkerPool>,
    monitor: Arc<HealthMonitor<C>>,
    engine: Arc<DistributionEngine<C>>,
    failover: Arc<FailoverCoordinator<C>>,
    federator: QueryFederator<C>,
    events: Mutex<Option<mpsc::Receiver<HealthEvent>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: NodeClient> std::fmt::Debug for Coordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("listen", &self.config.listen)
            .field("backend", &self.store.backend())
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> Coordinator<C> {
    pub fn new(config: CoordinatorConfig, client: Arc<C>, store: Arc<dyn StateStore>) -> Self {
        let registry = Arc::new(NodeRegistry::new(
            config.ring.virtual_nodes,
            config.health.initial_state,
        ));
        let pool = Arc::new(WorkerPool::new(config.distribution.worker_pool_size));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let monitor = HealthMonitor::new(
            registry.clone(),
            client.clone(),
            HealthMonitorConfig {
                check_interval: config.health.check_interval(),
                probe_timeout: config.health.probe_timeout(),
                grace_period: config.health.grace_period(),
                max_concurrent_probes: config.health.max_concurrent_probes,
            },
            events_tx,
        )
        .with_store(store.clone());

        let d = &config.distribution;
        let engine = Arc::new(DistributionEngine::new(
            registry.clone(),
            client.clone(),
            store.clone(),
            DistributionOptions {
                replicas: config.ring.replicas,
                retry: RetryPolicy {
                    max_attempts: d.retry_attempts,
                    base_delay: Duration::from_millis(d.retry_base_ms),
                    max_delay: Duration::from_millis(d.retry_max_ms),
                    jitter: Duration::from_millis(d.retry_jitter_ms),
                },
                push_timeout: Duration::from_millis(d.push_timeout_ms),
            },
        ));
        let failover = Arc::new(FailoverCoordinator::new(
            engine.clone(),
            pool.clone(),
            d.eager_rebalance,
        ));
        let federator = QueryFederator::new(
            registry.clone(),
            client,
            Duration::from_millis(config.federation.node_timeout_ms),
            Duration::from_millis(config.federation.deadline_ms),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            store,
            pool,
            monitor: Arc::new(monitor),
            engine,
            failover,
            federator,
            events: Mutex::new(Some(events_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build with the persistence backend named in `config`.
    pub fn from_config(config: CoordinatorConfig, client: Arc<C>) -> Self {
        let store = open_store(&config.persistence);
        Self::new(config, client, store)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor<C>> {
        &self.monitor
    }

    pub fn engine(&self) -> &Arc<DistributionEngine<C>> {
        &self.engine
    }

    pub fn failover(&self) -> &Arc<FailoverCoordinator<C>> {
        &self.failover
    }

    pub fn static_nodes(&self) -> Vec<NodeAddr> {
        self.config.discovery.nodes.iter().map(NodeAddr::new).collect()
    }

    /// Restore persisted nodes and register the static list. Returns the
    /// number of known nodes afterwards.
    pub async fn bootstrap(&self) -> usize {
        self.monitor.restore_nodes().await;
        if self.config.discovery.mode == DiscoveryMode::Static {
            if self.config.discovery.nodes.is_empty() {
                tracing::warn!("static discovery with an empty node list; waiting for registrations");
            }
            for node in self.static_nodes() {
                self.monitor.register(node).await;
            }
        }
        let known = self.registry.snapshot().len();
        tracing::info!(
            "bootstrapped {} node(s), ring v{}, {} backend",
            known,
            self.registry.ring_version(),
            self.store.backend()
        );
        known
    }

    /// Start the health monitor and failover loops. Calling it twice is a
    /// no-op.
    pub fn start(&self) {
        let Some(events) = self.events.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            tracing::debug!("coordinator already started");
            return;
        };
        let monitor = self.monitor.clone().spawn(self.shutdown.subscribe());
        let failover = self.failover.clone().spawn(events, self.shutdown.subscribe());
        self.track(monitor);
        self.track(failover);
    }

    /// Start polling the upstream registry feed.
    pub fn start_feed<F: RegistryFeed>(&self, feed: Arc<F>) {
        let poller = Arc::new(FeedPoller::new(
            feed,
            self.monitor.clone(),
            self.engine.clone(),
            self.pool.clone(),
            self.config.discovery.mode,
            self.static_nodes(),
            Duration::from_secs(self.config.registry.fetch_interval_secs),
        ));
        let handle = poller.spawn(self.shutdown.subscribe());
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Distribute one offering through the worker pool.
    pub async fn submit(&self, offering: Offering) -> Result<DistributionReport, DistributionError> {
        let engine = self.engine.clone();
        self.pool.run(async move { engine.distribute(offering).await }).await?
    }

    pub async fn placement(&self, offering_id: &str) -> Result<Option<ReplicaAssignment>, StoreError> {
        self.engine.placement(offering_id).await
    }

    pub async fn federate(&self, query: &str) -> Result<FederatedResult, FederationError> {
        self.federator.federate(query).await
    }

    pub async fn register_node(&self, addr: NodeAddr) -> bool {
        self.monitor.register(addr).await
    }

    pub async fn deregister_node(&self, addr: &NodeAddr) -> bool {
        self.monitor.deregister(addr).await
    }

    /// Stop background loops, drain the worker pool and flush the store, all
    /// within one `shutdown_grace_secs` window. Loops still running at the
    /// deadline are aborted.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        tracing::info!("shutting down (grace {:?})", grace);
        self.shutdown.send_replace(true);

        if !self.pool.shutdown(deadline.saturating_duration_since(Instant::now())).await {
            tracing::warn!("in-flight pushes cancelled at shutdown");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                tracing::warn!("background task still running at the shutdown deadline; aborting");
                task.abort();
            }
        }

        match tokio::time::timeout_at(deadline, self.store.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("failed to flush state store: {}", e),
            Err(_) => tracing::error!("state store flush did not finish before the shutdown deadline"),
        }
        tracing::info!("coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_client::NodeError;
    use catalogue_common::HealthState;
    use serde_json::{json, Value};

    struct EchoClient;

    #[async_trait::async_trait]
    impl NodeClient for EchoClient {
        async fn probe(&self, _node: &NodeAddr) -> Result<(), NodeError> {
            Ok(())
        }

        async fn push(&self, _node: &NodeAddr, _offering: &Offering) -> Result<(), NodeError> {
            Ok(())
        }

        async fn query(&self, node: &NodeAddr, _query: &str) -> Result<Vec<Value>, NodeError> {
            Ok(vec![json!({"node": node.as_str()})])
        }
    }

    fn config(nodes: &[&str]) -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.health.initial_state = HealthState::Healthy;
        config.discovery.nodes = nodes.iter().map(|s| s.to_string()).collect();
        config.shutdown_grace_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_shutdown_bounded_by_single_grace_window() {
        tokio::time::pause();
        let coord = Coordinator::new(config(&["http://n1"]), Arc::new(EchoClient), Arc::new(MemoryStore::new()));
        let _stuck_push = coord
            .pool()
            .spawn(std::future::pending::<()>())
            .await
            .unwrap();
        coord
            .tasks
            .lock()
            .unwrap()
            .push(tokio::spawn(std::future::pending::<()>()));

        let started = Instant::now();
        coord.shutdown().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1500), "shutdown took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_bootstrap_registers_static_nodes() {
        let coord = Coordinator::new(
            config(&["http://n1", "http://n2"]),
            Arc::new(EchoClient),
            Arc::new(MemoryStore::new()),
        );
        assert_eq!(coord.bootstrap().await, 2);
        assert_eq!(coord.registry().snapshot().ring().len(), 2);
    }

    #[tokio::test]
    async fn test_submit_and_placement() {
        let coord = Coordinator::new(
            config(&["http://n1", "http://n2", "http://n3"]),
            Arc::new(EchoClient),
            Arc::new(MemoryStore::new()),
        );
        coord.bootstrap().await;
        let report = coord.submit(Offering::new("o1", b"{}".to_vec())).await.unwrap();
        assert_eq!(report.assignment.nodes.len(), 2);
        assert_eq!(coord.placement("o1").await.unwrap(), Some(report.assignment));
    }

    #[tokio::test]
    async fn test_federate_over_static_nodes() {
        let coord = Coordinator::new(
            config(&["http://n1", "http://n2"]),
            Arc::new(EchoClient),
            Arc::new(MemoryStore::new()),
        );
        coord.bootstrap().await;
        let out = coord.federate("SELECT *").await.unwrap();
        assert_eq!(out.results.len(), 2);
    }

    #[tokio::test]
    async fn test_wal_store_falls_back_to_memory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let persistence = PersistenceConfig {
            backend: PersistenceBackend::Wal,
            // A regular file cannot be used as the data directory.
            data_dir: file.path().join("nested"),
            fsync: "none".into(),
        };
        assert_eq!(open_store(&persistence).backend(), "memory");
    }

    #[tokio::test]
    async fn test_state_survives_restart_with_wal_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&["http://n1", "http://n2"]);
        cfg.persistence = PersistenceConfig {
            backend: PersistenceBackend::Wal,
            data_dir: dir.path().to_path_buf(),
            fsync: "always".into(),
        };

        {
            let coord = Coordinator::from_config(cfg.clone(), Arc::new(EchoClient));
            coord.bootstrap().await;
            coord.submit(Offering::new("o1", b"x".to_vec())).await.unwrap();
            coord.shutdown().await;
        }

        cfg.discovery.nodes.clear();
        let coord = Coordinator::from_config(cfg, Arc::new(EchoClient));
        assert_eq!(coord.bootstrap().await, 2);
        assert!(coord.placement("o1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let coord = Coordinator::new(
            config(&["http://n1"]),
            Arc::new(EchoClient),
            Arc::new(MemoryStore::new()),
        );
        coord.bootstrap().await;
        coord.start();
        coord.start();
        coord.shutdown().await;
        assert!(coord.pool().is_closed());
        assert!(matches!(
            coord.submit(Offering::new("o1", b"x".to_vec())).await,
            Err(DistributionError::Pool(_))
        ));
    }
}
