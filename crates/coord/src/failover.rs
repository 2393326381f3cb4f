//! Failover: re-places offerings when their nodes leave the ring.
//!
//! A pass loads the affected assignments, recomputes each against the
//! current ring, pushes to nodes that were not already holding the offering
//! and saves the new node list. The lost node's slot is dropped. Every
//! offering is its own job in the shared worker pool, and a push that
//! exhausts its retries leaves the offering under-replicated instead of
//! blocking the rest of the pass.

use crate::distribution::DistributionEngine;
use crate::health::HealthEvent;
use crate::node_client::NodeClient;
use crate::offering::ReplicaAssignment;
use crate::pool::{PoolError, WorkerPool};
use crate::store::StoreError;
use catalogue_common::NodeAddr;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),
}

/// Summary of one failover pass.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverReport {
    pub trigger: String,
    pub examined: usize,
    /// Assignments already computed under the current ring.
    pub skipped_current: usize,
    pub reassigned: usize,
    pub under_replicated: Vec<String>,
    /// `(offering_id, reason)` for offerings the pass could not process.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Current,
    Reassigned(ReplicaAssignment),
}

pub struct FailoverCoordinator<C: NodeClient> {
    engine: Arc<DistributionEngine<C>>,
    pool: Arc<WorkerPool>,
    eager_rebalance: bool,
}

impl<C: NodeClient> std::fmt::Debug for FailoverCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCoordinator")
            .field("eager_rebalance", &self.eager_rebalance)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient> FailoverCoordinator<C> {
    pub fn new(engine: Arc<DistributionEngine<C>>, pool: Arc<WorkerPool>, eager_rebalance: bool) -> Self {
        Self {
            engine,
            pool,
            eager_rebalance,
        }
    }

    /// React to one health event. `None` means the event needs no pass.
    pub async fn handle_event(&self, event: &HealthEvent) -> Result<Option<FailoverReport>, FailoverError> {
        match event {
            HealthEvent::NodeDown { address, .. } | HealthEvent::NodeRemoved { address, .. } => {
                self.on_node_lost(address).await.map(Some)
            }
            HealthEvent::NodeUp { .. } if self.eager_rebalance => self.reconcile_stale().await.map(Some),
            HealthEvent::NodeUp { .. } => Ok(None),
        }
    }

    /// Re-place every offering whose assignment lists `node`.
    pub async fn on_node_lost(&self, node: &NodeAddr) -> Result<FailoverReport, FailoverError> {
        let affected: Vec<ReplicaAssignment> = self
            .engine
            .load_assignments()
            .await?
            .into_iter()
            .filter(|a| a.contains(node))
            .collect();
        Ok(self.run_pass(format!("node lost: {}", node), affected).await)
    }

    /// Re-place every offering computed under an older ring version.
    pub async fn reconcile_stale(&self) -> Result<FailoverReport, FailoverError> {
        let current = self.engine.registry().ring_version();
        let stale: Vec<ReplicaAssignment> = self
            .engine
            .load_assignments()
            .await?
            .into_iter()
            .filter(|a| a.ring_version < current)
            .collect();
        Ok(self.run_pass(format!("rebalance to ring v{}", current), stale).await)
    }

    /// Reassign `assignments` through the worker pool.
    pub async fn run_pass(&self, trigger: String, assignments: Vec<ReplicaAssignment>) -> FailoverReport {
        let m = catalogue_metrics::metrics();
        m.failover_passes.inc();

        let mut report = FailoverReport {
            trigger,
            examined: assignments.len(),
            ..Default::default()
        };

        let ids: Vec<String> = assignments.iter().map(|a| a.offering_id.clone()).collect();
        let jobs = assignments.into_iter().map(|old| {
            let engine = Arc::clone(&self.engine);
            async move { reassign(&engine, old).await }
        });

        for (id, result) in ids.into_iter().zip(self.pool.run_all(jobs).await) {
            match result.map_err(FailoverError::from).and_then(|r| r) {
                Ok(Outcome::Current) => report.skipped_current += 1,
                Ok(Outcome::Reassigned(assignment)) => {
                    report.reassigned += 1;
                    if assignment.under_replicated {
                        report.under_replicated.push(id);
                    }
                }
                Err(e) => {
                    tracing::warn!("failover of offering {} failed: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        m.failover_reassignments.inc_by(report.reassigned as u64);
        tracing::info!(
            "failover pass ({}): {} examined, {} reassigned, {} current, {} under-replicated, {} failed",
            report.trigger,
            report.examined,
            report.reassigned,
            report.skipped_current,
            report.under_replicated.len(),
            report.failed.len()
        );
        report
    }

    /// Consume health events until the channel closes or `shutdown` flips.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::Receiver<HealthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = self.handle_event(&event).await {
                            tracing::error!("failover for {} aborted: {}", event.address(), e);
                        }
                    }
                }
            }
            tracing::info!("failover coordinator stopped");
        })
    }
}

/// Recompute one assignment against the current ring.
async fn reassign<C: NodeClient>(
    engine: &DistributionEngine<C>,
    old: ReplicaAssignment,
) -> Result<Outcome, FailoverError> {
    let snapshot = engine.registry().snapshot();
    let ring = snapshot.ring();
    if old.ring_version == ring.version() && old.nodes.iter().all(|n| ring.contains(n)) {
        return Ok(Outcome::Current);
    }

    let replicas = engine.replicas();
    let desired = ring.lookup(&old.offering_id, replicas);
    let newcomers: Vec<NodeAddr> = desired.iter().filter(|n| !old.contains(n)).cloned().collect();

    let mut pushed: Vec<NodeAddr> = Vec::new();
    if !newcomers.is_empty() {
        match engine.cached_offering(&old.offering_id).await? {
            Some(offering) => {
                for (node, result) in engine.push_all(&newcomers, &offering).await {
                    match result {
                        Ok(()) => pushed.push(node),
                        Err(e) => tracing::warn!(
                            "failover push of {} to {} failed: {}",
                            old.offering_id,
                            node,
                            e
                        ),
                    }
                }
            }
            None => tracing::warn!(
                "no cached content for offering {}; cannot push to {} new node(s)",
                old.offering_id,
                newcomers.len()
            ),
        }
    }

    // Desired nodes that hold the content, in ring order.
    let mut nodes: Vec<NodeAddr> = desired
        .into_iter()
        .filter(|n| old.contains(n) || pushed.contains(n))
        .collect();
    // Previous holders still on the ring cover slots whose push failed.
    for n in &old.nodes {
        if nodes.len() >= replicas {
            break;
        }
        if ring.contains(n) && !nodes.contains(n) {
            nodes.push(n.clone());
        }
    }

    let assignment = ReplicaAssignment::new(old.offering_id, nodes, ring.version(), replicas);
    engine.save_assignment(&assignment).await?;
    Ok(Outcome::Reassigned(assignment))
}

// ────────────────────────── Tests ──────────────────────────
