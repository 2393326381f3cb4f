//! Node registry: the canonical set of known catalogue nodes.
//!
//! Readers call [`NodeRegistry::snapshot`] and get an `Arc` to an immutable
//! `(nodes, ring)` pair; they never block writers and never see a node table
//! that disagrees with its ring. Every mutation goes through one serialized
//! path that clones the current snapshot, edits it, decides whether ring
//! membership changed, and publishes the result with a single atomic store.
//!
//! Ring membership rule: a node sits on the ring when it is HEALTHY, or
//! SUSPECT after having been confirmed healthy at least once. DOWN nodes and
//! never-confirmed SUSPECT nodes stay in the table (visible to operators)
//! but own no keys.

use crate::ring::HashRing;
use arc_swap::ArcSwap;
use catalogue_common::{HealthState, NodeAddr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub address: NodeAddr,
    pub health: HealthState,
    /// Wall-clock millis of the last successful probe.
    pub last_seen_ms: Option<u64>,
    pub consecutive_failures: u32,
    /// Whether the node has ever passed a probe (or was registered healthy).
    #[serde(default)]
    pub confirmed: bool,
    /// Start of the current failure streak, on the monotonic clock.
    #[serde(skip)]
    pub first_failure: Option<Instant>,
    /// Registration order; used to keep ring construction deterministic.
    #[serde(skip)]
    seq: u64,
}

impl Node {
    fn new(address: NodeAddr, initial: HealthState, seq: u64) -> Self {
        let confirmed = initial == HealthState::Healthy;
        Self {
            address,
            health: initial,
            last_seen_ms: None,
            consecutive_failures: 0,
            confirmed,
            first_failure: None,
            seq,
        }
    }

    /// Whether this node's virtual points belong on the ring.
    pub fn in_ring(&self) -> bool {
        match self.health {
            HealthState::Healthy => true,
            HealthState::Suspect => self.confirmed,
            HealthState::Down => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable view of the registry at one point in time.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    nodes: BTreeMap<NodeAddr, Node>,
    ring: Arc<HashRing>,
}

impl RegistrySnapshot {
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn get(&self, addr: &NodeAddr) -> Option<&Node> {
        self.nodes.get(addr)
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.nodes.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes currently HEALTHY, in address order.
    pub fn healthy_nodes(&self) -> Vec<NodeAddr> {
        self.nodes
            .values()
            .filter(|n| n.health == HealthState::Healthy)
            .map(|n| n.address.clone())
            .collect()
    }

    pub fn count(&self, health: HealthState) -> usize {
        self.nodes.values().filter(|n| n.health == health).count()
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    pub fn ring_version(&self) -> u64 {
        self.ring.version()
    }

    /// Shorthand for `ring().lookup(key, n)`.
    pub fn lookup(&self, key: &str, n: usize) -> Vec<NodeAddr> {
        self.ring.lookup(key, n)
    }

    /// Nodes in registration order, for persistence.
    pub fn to_vec(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }
}

// ---------------------------------------------------------------------------
// HealthChange
// ---------------------------------------------------------------------------

/// Result of a mutation that touched a node's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChange {
    pub address: NodeAddr,
    pub from: HealthState,
    pub to: HealthState,
    /// Ring version after the mutation was published.
    pub ring_version: u64,
    /// Whether ring membership changed (and the version was bumped).
    pub ring_changed: bool,
}

impl HealthChange {
    pub fn is_transition(&self) -> bool {
        self.from != self.to
    }
}

// ---------------------------------------------------------------------------
// NodeRegistry
// ---------------------------------------------------------------------------

pub struct NodeRegistry {
    state: ArcSwap<RegistrySnapshot>,
    /// Serializes all writers; readers never take it.
    write_lock: Mutex<u64>,
    initial_state: HealthState,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.state.load();
        f.debug_struct("NodeRegistry")
            .field("nodes", &snap.nodes.len())
            .field("ring_version", &snap.ring.version())
            .field("initial_state", &self.initial_state)
            .finish()
    }
}

impl NodeRegistry {
    /// `initial_state` is the health assigned on registration; it must be
    /// HEALTHY or SUSPECT.
    pub fn new(virtual_nodes: usize, initial_state: HealthState) -> Self {
        debug_assert_ne!(initial_state, HealthState::Down);
        let empty = RegistrySnapshot {
            nodes: BTreeMap::new(),
            ring: Arc::new(HashRing::new(virtual_nodes)),
        };
        Self {
            state: ArcSwap::from_pointee(empty),
            write_lock: Mutex::new(0),
            initial_state,
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.state.load_full()
    }

    pub fn ring_version(&self) -> u64 {
        self.state.load().ring.version()
    }

    pub fn initial_state(&self) -> HealthState {
        self.initial_state
    }

    /// Register a node. Idempotent: returns `false` if it was already known.
    pub fn register(&self, addr: NodeAddr) -> bool {
        let initial = self.initial_state;
        let added = self.commit(|nodes, seq| {
            if nodes.contains_key(&addr) {
                return None;
            }
            *seq += 1;
            nodes.insert(addr.clone(), Node::new(addr.clone(), initial, *seq));
            Some(())
        });
        if added.is_some() {
            tracing::info!("registered node {} as {}", addr, initial);
        }
        added.is_some()
    }

    /// Remove a node entirely. Returns its last state if it was known.
    pub fn deregister(&self, addr: &NodeAddr) -> Option<Node> {
        let (node, _, _) = self.commit(|nodes, _| nodes.remove(addr))?;
        tracing::info!("deregistered node {} (was {})", addr, node.health);
        Some(node)
    }

    /// Force a node's health. Moving to HEALTHY confirms the node and clears
    /// its failure streak.
    pub fn set_health(&self, addr: &NodeAddr, state: HealthState) -> Option<HealthChange> {
        self.update(addr, |node| {
            node.health = state;
            if state == HealthState::Healthy {
                node.confirmed = true;
                node.consecutive_failures = 0;
                node.first_failure = None;
            }
        })
    }

    /// Apply an arbitrary edit to one node through the serialized path.
    /// Returns `None` if the node is unknown.
    pub fn update<F>(&self, addr: &NodeAddr, edit: F) -> Option<HealthChange>
    where
        F: FnOnce(&mut Node),
    {
        let ((from, to), ring_version, ring_changed) = self.commit(|nodes, _| {
            let node = nodes.get_mut(addr)?;
            let from = node.health;
            edit(node);
            Some((from, node.health))
        })?;
        Some(HealthChange {
            address: addr.clone(),
            from,
            to,
            ring_version,
            ring_changed,
        })
    }

    /// The single mutation path.
    ///
    /// Runs `f` on a private copy of the node table. `None` means nothing
    /// changed and nothing is published. Otherwise the copy is published
    /// together with a ring that is rebuilt iff membership changed.
    /// Returns `(f's output, ring_version, ring_changed)`.
    fn commit<T, F>(&self, f: F) -> Option<(T, u64, bool)>
    where
        F: FnOnce(&mut BTreeMap<NodeAddr, Node>, &mut u64) -> Option<T>,
    {
        let mut seq = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let current = self.state.load_full();
        let mut nodes = current.nodes.clone();
        let out = f(&mut nodes, &mut seq)?;

        let ring = next_ring(&current.ring, &nodes);
        let ring_changed = ring.version() != current.ring.version();
        if ring_changed {
            tracing::info!(
                "ring rebuilt: v{} -> v{} ({} members)",
                current.ring.version(),
                ring.version(),
                ring.len()
            );
        }
        let version = ring.version();

        publish_gauges(&nodes, version);
        self.state.store(Arc::new(RegistrySnapshot { nodes, ring }));
        Some((out, version, ring_changed))
    }
}

/// Derive the ring for `nodes` from `current`, reusing it when membership is
/// unchanged. A single mutation changes at most one member, but this handles
/// any difference by applying removals then additions in registration order.
fn next_ring(current: &Arc<HashRing>, nodes: &BTreeMap<NodeAddr, Node>) -> Arc<HashRing> {
    let mut wanted: Vec<&Node> = nodes.values().filter(|n| n.in_ring()).collect();
    wanted.sort_by_key(|n| n.seq);

    let stale: Vec<&NodeAddr> = current
        .members()
        .iter()
        .filter(|m| !nodes.get(*m).is_some_and(Node::in_ring))
        .collect();
    let fresh: Vec<&NodeAddr> = wanted
        .iter()
        .map(|n| &n.address)
        .filter(|a| !current.contains(a))
        .collect();

    if stale.is_empty() && fresh.is_empty() {
        return current.clone();
    }
    if stale.len() + fresh.len() == 1 {
        let next = match (stale.first(), fresh.first()) {
            (Some(gone), _) => current.remove_node(gone),
            (_, Some(new)) => current.add_node((*new).clone()),
            _ => unreachable!(),
        };
        return Arc::new(next);
    }
    Arc::new(HashRing::build(
        wanted.into_iter().map(|n| n.address.clone()),
        current.virtual_nodes(),
        current.version() + 1,
    ))
}

fn publish_gauges(nodes: &BTreeMap<NodeAddr, Node>, ring_version: u64) {
    let m = catalogue_metrics::metrics();
    m.ring_version.set(ring_version as i64);
    for state in [HealthState::Healthy, HealthState::Suspect, HealthState::Down] {
        let count = nodes.values().filter(|n| n.health == state).count();
        m.nodes_by_health
            .with_label_values(&[state.as_str()])
            .set(count as i64);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
