//! Health monitor: periodic probes driving the per-node state machine.
//!
//! ```text
//! HEALTHY --fail--> SUSPECT --fail, streak >= grace--> DOWN
//!    ^                 |                                 |
//!    +-----success-----+--------------success------------+
//! ```
//!
//! Probes run concurrently with bounded parallelism, each under its own
//! timeout; a hung node costs at most one timeout and never delays the
//! verdict on other nodes. Transitions into and out of DOWN are published on
//! an event channel consumed by the failover coordinator.

use crate::node_client::NodeClient;
use crate::store::{self, StateStore};
use catalogue_common::{now_ms, HealthState, NodeAddr};
use catalogue_ring::{HealthChange, Node, NodeRegistry};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Capacity of the health event channel. When the failover side falls this
/// far behind, publishing waits for it instead of queueing more.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Node entered DOWN and left the ring.
    NodeDown { address: NodeAddr, ring_version: u64 },
    /// Node joined (or rejoined) the ring as HEALTHY.
    NodeUp { address: NodeAddr, ring_version: u64 },
    /// Node was deregistered.
    NodeRemoved { address: NodeAddr, ring_version: u64 },
}

impl HealthEvent {
    pub fn address(&self) -> &NodeAddr {
        match self {
            HealthEvent::NodeDown { address, .. }
            | HealthEvent::NodeUp { address, .. }
            | HealthEvent::NodeRemoved { address, .. } => address,
        }
    }

    /// The event a registry change should publish, if any.
    fn from_change(change: &HealthChange) -> Option<Self> {
        let address = change.address.clone();
        let ring_version = change.ring_version;
        match (change.from, change.to) {
            (from, HealthState::Down) if from != HealthState::Down => Some(HealthEvent::NodeDown {
                address,
                ring_version,
            }),
            (_, HealthState::Healthy) if change.ring_changed => Some(HealthEvent::NodeUp {
                address,
                ring_version,
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Apply one probe result to a node.
pub fn apply_probe(node: &mut Node, ok: bool, now: Instant, grace: Duration) {
    if ok {
        node.health = HealthState::Healthy;
        node.confirmed = true;
        node.consecutive_failures = 0;
        node.first_failure = None;
        node.last_seen_ms = Some(now_ms());
        return;
    }

    node.consecutive_failures = node.consecutive_failures.saturating_add(1);
    let since = *node.first_failure.get_or_insert(now);
    node.health = match node.health {
        HealthState::Healthy => HealthState::Suspect,
        HealthState::Suspect if now.duration_since(since) >= grace => HealthState::Down,
        other => other,
    };
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub max_concurrent_probes: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            grace_period: Duration::from_secs(60),
            max_concurrent_probes: 16,
        }
    }
}

/// Summary of one sweep.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub probed: usize,
    pub failed: usize,
    pub transitions: Vec<HealthChange>,
}

pub struct HealthMonitor<C: NodeClient> {
    registry: Arc<NodeRegistry>,
    client: Arc<C>,
    config: HealthMonitorConfig,
    events: mpsc::Sender<HealthEvent>,
    store: Option<Arc<dyn StateStore>>,
}

impl<C: NodeClient> std::fmt::Debug for HealthMonitor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> HealthMonitor<C> {
    pub fn new(
        registry: Arc<NodeRegistry>,
        client: Arc<C>,
        config: HealthMonitorConfig,
        events: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            events,
            store: None,
        }
    }

    /// Persist the node list after every sweep and membership change.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Register a node (idempotent). New nodes start in the registry's
    /// initial state and are confirmed by their first successful probe.
    pub async fn register(&self, addr: NodeAddr) -> bool {
        let added = self.registry.register(addr);
        if added {
            self.persist_nodes().await;
        }
        added
    }

    /// Deregister a node and publish `NodeRemoved`.
    pub async fn deregister(&self, addr: &NodeAddr) -> bool {
        if self.registry.deregister(addr).is_none() {
            return false;
        }
        self.publish(HealthEvent::NodeRemoved {
            address: addr.clone(),
            ring_version: self.registry.ring_version(),
        })
        .await;
        self.persist_nodes().await;
        true
    }

    /// Re-register nodes persisted by a previous run. Health restarts at the
    /// initial state. Returns the number of nodes restored.
    pub async fn restore_nodes(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let nodes: Vec<Node> = match store::get_json(store.as_ref(), store::NODES_KEY).await {
            Ok(Some(nodes)) => nodes,
            Ok(None) => return 0,
            Err(e) => {
                tracing::warn!("could not read persisted node list: {}", e);
                return 0;
            }
        };
        let restored = nodes
            .into_iter()
            .filter(|n| self.registry.register(n.address.clone()))
            .count();
        if restored > 0 {
            tracing::info!("restored {} node(s) from {}", restored, store.backend());
        }
        restored
    }

    async fn persist_nodes(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let nodes = self.registry.snapshot().to_vec();
        if let Err(e) = store::put_json(store.as_ref(), store::NODES_KEY, &nodes).await {
            tracing::warn!("failed to persist node list: {}", e);
        }
    }

    async fn publish(&self, event: HealthEvent) {
        let event = match self.events.try_send(event) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    "health event queue full ({} pending); waiting for failover",
                    EVENT_QUEUE_CAPACITY
                );
                event
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("health event dropped: no failover listener");
                return;
            }
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!("health event dropped: no failover listener");
        }
    }

    // -----------------------------------------------------------------------
    // Probing
    // -----------------------------------------------------------------------

    /// Probe one node under the probe timeout. A timeout is a failure.
    pub async fn probe_node(&self, addr: &NodeAddr) -> bool {
        let m = catalogue_metrics::metrics();
        m.probes_total.inc();
        let _timer = m.probe_latency_secs.start_timer();
        let ok = match tokio::time::timeout(self.config.probe_timeout, self.client.probe(addr)).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("probe of {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                tracing::debug!("probe of {} timed out after {:?}", addr, self.config.probe_timeout);
                false
            }
        };
        if !ok {
            m.probes_failed.inc();
        }
        ok
    }

    /// Probe every known node once and apply the results.
    pub async fn sweep(&self) -> SweepReport {
        let targets: Vec<NodeAddr> = self
            .registry
            .snapshot()
            .nodes()
            .map(|n| n.address.clone())
            .collect();

        let mut report = SweepReport::default();
        let mut probes = futures::stream::iter(targets)
            .map(|addr| async move {
                let ok = self.probe_node(&addr).await;
                (addr, ok)
            })
            .buffer_unordered(self.config.max_concurrent_probes.max(1));

        while let Some((addr, ok)) = probes.next().await {
            report.probed += 1;
            if !ok {
                report.failed += 1;
            }
            let now = Instant::now();
            let grace = self.config.grace_period;
            let Some(change) = self
                .registry
                .update(&addr, |node| apply_probe(node, ok, now, grace))
            else {
                // Deregistered while the probe was in flight.
                continue;
            };
            if change.is_transition() {
                self.on_transition(&change).await;
                report.transitions.push(change);
            }
        }

        self.persist_nodes().await;
        report
    }

    async fn on_transition(&self, change: &HealthChange) {
        catalogue_metrics::metrics()
            .health_transitions
            .with_label_values(&[change.to.as_str()])
            .inc();
        match change.to {
            HealthState::Down => tracing::warn!(
                "node {} {} -> {} (ring v{})",
                change.address,
                change.from,
                change.to,
                change.ring_version
            ),
            _ => tracing::info!(
                "node {} {} -> {} (ring v{})",
                change.address,
                change.from,
                change.to,
                change.ring_version
            ),
        }
        if let Some(event) = HealthEvent::from_change(change) {
            self.publish(event).await;
        }
    }

    /// Run sweeps every `check_interval` until `shutdown` flips. A sweep in
    /// progress at shutdown is dropped, cancelling its outstanding probes.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.config.check_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                "health monitor started: every {:?}, timeout {:?}, grace {:?}",
                self.config.check_interval,
                self.config.probe_timeout,
                self.config.grace_period
            );
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = async {
                        tick.tick().await;
                        self.sweep().await
                    } => {}
                }
            }
            tracing::info!("health monitor stopped");
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
