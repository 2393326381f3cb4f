//! End-to-end tests over an in-memory cluster.
//!
//! Every node is a map of offering id to content; pushes upsert into it and
//! queries return one row per stored offering. The cluster client is wrapped
//! in `ChaosNodeClient` to fail or hang individual nodes.

use catalogue_common::{ring_hash, HealthState, NodeAddr};
use catalogue_config::CoordinatorConfig;
use catalogue_coord::chaos::{ChaosConfig, ChaosNodeClient};
use catalogue_coord::store::MemoryStore;
use catalogue_coord::{Coordinator, NodeClient, NodeError, Offering};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// In-memory cluster
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InMemNodeClient {
    nodes: Mutex<HashMap<NodeAddr, HashMap<String, Vec<u8>>>>,
}

impl InMemNodeClient {
    fn stored(&self, node: &NodeAddr) -> HashMap<String, Vec<u8>> {
        self.nodes
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    fn holds(&self, node: &NodeAddr, offering_id: &str) -> bool {
        self.stored(node).contains_key(offering_id)
    }
}

#[async_trait::async_trait]
impl NodeClient for InMemNodeClient {
    async fn probe(&self, _node: &NodeAddr) -> Result<(), NodeError> {
        Ok(())
    }

    async fn push(&self, node: &NodeAddr, offering: &Offering) -> Result<(), NodeError> {
        self.nodes
            .lock()
            .unwrap()
            .entry(node.clone())
            .or_default()
            .insert(offering.id.clone(), offering.content.clone());
        Ok(())
    }

    async fn query(&self, node: &NodeAddr, _query: &str) -> Result<Vec<Value>, NodeError> {
        let mut ids: Vec<String> = self.stored(node).into_keys().collect();
        ids.sort();
        Ok(ids.into_iter().map(|id| json!({ "offering": id })).collect())
    }
}

type Cluster = ChaosNodeClient<InMemNodeClient>;

fn addr(i: usize) -> NodeAddr {
    NodeAddr::new(format!("http://node-{}:3030", i))
}

fn config(nodes: usize, replicas: usize) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.ring.replicas = replicas;
    config.ring.virtual_nodes = 150;
    config.health.initial_state = HealthState::Healthy;
    config.health.check_interval_secs = 1;
    config.health.grace_period_secs = 2;
    config.health.probe_timeout_ms = 200;
    config.distribution.retry_attempts = 2;
    config.distribution.retry_base_ms = 10;
    config.distribution.retry_max_ms = 20;
    config.distribution.retry_jitter_ms = 0;
    config.federation.node_timeout_ms = 500;
    config.federation.deadline_ms = 1000;
    config.shutdown_grace_secs = 1;
    config.discovery.nodes = (1..=nodes).map(|i| addr(i).to_string()).collect();
    config
}

async fn cluster(nodes: usize, replicas: usize) -> (Coordinator<Cluster>, Arc<Cluster>) {
    let client = Arc::new(ChaosNodeClient::new(
        InMemNodeClient::default(),
        ChaosConfig::default(),
    ));
    let coord = Coordinator::new(config(nodes, replicas), client.clone(), Arc::new(MemoryStore::new()));
    coord.bootstrap().await;
    (coord, client)
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Walk the ring points by hand: the first `n` distinct owners clockwise
/// from the key's hash.
fn walk_ring(points: &[(u64, NodeAddr)], key: &str, n: usize) -> Vec<NodeAddr> {
    let h = ring_hash(key.as_bytes());
    let start = points.iter().position(|(p, _)| *p >= h).unwrap_or(0);
    let mut out = Vec::new();
    for i in 0..points.len() {
        let node = &points[(start + i) % points.len()].1;
        if !out.contains(node) {
            out.push(node.clone());
        }
        if out.len() == n {
            break;
        }
    }
    out
}

#[tokio::test]
async fn test_two_replicas_on_three_nodes_follow_ring_order() {
    let (coord, client) = cluster(3, 2).await;
    let report = coord.submit(Offering::new("O1", b"{}".to_vec())).await.unwrap();

    let snapshot = coord.registry().snapshot();
    let points: Vec<(u64, NodeAddr)> = snapshot
        .ring()
        .points()
        .iter()
        .map(|e| (e.hash, e.node.clone()))
        .collect();
    assert_eq!(points.len(), 3 * 150);

    let expected = walk_ring(&points, "O1", 2);
    assert_eq!(report.assignment.nodes, expected);
    assert!(!report.under_replicated());
    for node in &expected {
        assert!(client.inner().holds(node, "O1"));
    }
    let third = (1..=3).map(addr).find(|a| !expected.contains(a)).unwrap();
    assert!(!client.inner().holds(&third, "O1"));
}

#[tokio::test]
async fn test_repush_is_idempotent() {
    let (coord, client) = cluster(3, 2).await;
    let offering = Offering::new("O1", b"{\"v\":1}".to_vec());
    let first = coord.submit(offering.clone()).await.unwrap();
    let before: Vec<_> = (1..=3).map(|i| client.inner().stored(&addr(i))).collect();

    let second = coord.submit(offering).await.unwrap();
    let after: Vec<_> = (1..=3).map(|i| client.inner().stored(&addr(i))).collect();
    assert_eq!(before, after);
    assert_eq!(first.assignment.nodes, second.assignment.nodes);
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_node_down_moves_replica_end_to_end() {
    tokio::time::pause();
    let (coord, client) = cluster(4, 2).await;
    let report = coord.submit(Offering::new("O1", b"content".to_vec())).await.unwrap();
    let a = report.assignment.nodes[0].clone();
    let b = report.assignment.nodes[1].clone();

    coord.start();
    client.fail_node(a.clone()).await;

    let mut moved = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let placement = coord.placement("O1").await.unwrap().unwrap();
        if !placement.contains(&a) {
            moved = Some(placement);
            break;
        }
    }
    let placement = moved.expect("failover never moved the replica");

    assert_eq!(
        coord.registry().snapshot().get(&a).unwrap().health,
        HealthState::Down
    );
    assert!(placement.contains(&b));
    assert_eq!(placement.nodes.len(), 2);
    let replacement = placement.nodes.iter().find(|n| **n != b).unwrap();
    assert!(client.inner().holds(replacement, "O1"));
    assert_eq!(client.inner().stored(replacement)["O1"], b"content".to_vec());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_failover_with_too_few_nodes_reports_under_replication() {
    let (coord, client) = cluster(2, 2).await;
    coord.submit(Offering::new("O1", b"x".to_vec())).await.unwrap();

    client.fail_node(addr(1)).await;
    coord.registry().set_health(&addr(1), HealthState::Down);
    let pass = coord.failover().on_node_lost(&addr(1)).await.unwrap();
    assert_eq!(pass.under_replicated, vec!["O1".to_string()]);

    let placement = coord.placement("O1").await.unwrap().unwrap();
    assert_eq!(placement.nodes, vec![addr(2)]);
    assert!(placement.under_replicated);
}

// ---------------------------------------------------------------------------
// Federation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_federation_with_one_hung_node() {
    tokio::time::pause();
    let (coord, client) = cluster(3, 3).await;
    coord.submit(Offering::new("O1", b"x".to_vec())).await.unwrap();
    coord.submit(Offering::new("O2", b"y".to_vec())).await.unwrap();
    client.hang_node(addr(2)).await;

    let out = coord.federate("SELECT * WHERE { ?s ?p ?o }").await.unwrap();
    assert_eq!(out.failed_nodes, vec![addr(2)]);
    assert_eq!(out.responded_nodes.len(), 2);
    // Both offerings live on every node; rows merge to one per offering.
    assert_eq!(
        out.results,
        vec![json!({"offering": "O1"}), json!({"offering": "O2"})]
    );
}

#[tokio::test]
async fn test_federation_with_every_node_failing_is_an_error() {
    let (coord, client) = cluster(2, 1).await;
    client.fail_node(addr(1)).await;
    client.fail_node(addr(2)).await;
    assert!(coord.federate("q").await.is_err());
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_flapping_node_recovers_without_going_down() {
    tokio::time::pause();
    let (coord, client) = cluster(3, 2).await;
    let monitor = coord.monitor();

    client.fail_node(addr(1)).await;
    monitor.sweep().await;
    assert_eq!(
        coord.registry().snapshot().get(&addr(1)).unwrap().health,
        HealthState::Suspect
    );
    let version = coord.registry().ring_version();

    tokio::time::advance(Duration::from_secs(1)).await;
    client.recover_node(&addr(1)).await;
    monitor.sweep().await;
    assert_eq!(
        coord.registry().snapshot().get(&addr(1)).unwrap().health,
        HealthState::Healthy
    );
    // Suspect never left the ring.
    assert_eq!(coord.registry().ring_version(), version);
}
