//! Upstream registry feed: node discovery and offering intake.
//!
//! The HTTP implementation of [`RegistryFeed`] lives in
//! `catalogue-net::feed`; this module owns the response parsing and the
//! polling loop that turns feed contents into registrations and
//! distribution batches.

use crate::distribution::{BatchReport, DistributionEngine};
use crate::health::HealthMonitor;
use crate::node_client::NodeClient;
use crate::offering::{extract_offering_id, Offering};
use crate::pool::WorkerPool;
use catalogue_common::NodeAddr;
use catalogue_config::DiscoveryMode;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Listings fetched concurrently per poll.
const LISTING_FETCH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),
    #[error("registry returned HTTP {0}")]
    Status(u16),
    #[error("invalid registry response: {0}")]
    Invalid(String),
}

/// One entry of the offerings list: where to fetch the listing, and its id
/// when the registry already names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferingRef {
    pub id: Option<String>,
    pub address: String,
}

#[async_trait::async_trait]
pub trait RegistryFeed: Send + Sync + 'static {
    async fn fetch_offering_refs(&self) -> Result<Vec<OfferingRef>, FeedError>;

    /// Raw listing body at `address`.
    async fn fetch_listing(&self, address: &str) -> Result<Vec<u8>, FeedError>;

    async fn fetch_nodes(&self) -> Result<Vec<NodeAddr>, FeedError>;
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn str_field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|n| obj.get(*n).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn list_items<'a>(body: &'a Value, keys: &[&str]) -> Result<&'a Vec<Value>, FeedError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(_) => keys
            .iter()
            .find_map(|k| body.get(*k).and_then(Value::as_array))
            .ok_or_else(|| FeedError::Invalid(format!("expected one of {:?}", keys))),
        _ => Err(FeedError::Invalid("expected a JSON array or object".into())),
    }
}

/// Parse the offerings list: `{"addresses": [...]}` or a bare array, whose
/// items are address strings or `{id?, address|url|endpoint}` objects.
pub fn parse_offering_refs(body: &Value) -> Result<Vec<OfferingRef>, FeedError> {
    let items = list_items(body, &["addresses", "offerings"])?;
    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(OfferingRef {
                id: None,
                address: s.trim().to_string(),
            }),
            Value::Object(_) => {
                let address = str_field(item, &["address", "url", "endpoint"])?;
                Some(OfferingRef {
                    id: str_field(item, &["id", "offeringId", "@id"]).map(str::to_string),
                    address: address.to_string(),
                })
            }
            _ => None,
        })
        .collect())
}

/// Parse the node list: bare address strings or `{id?, address|url|endpoint}`
/// objects, deduplicated in order.
pub fn parse_node_list(body: &Value) -> Result<Vec<NodeAddr>, FeedError> {
    let items = list_items(body, &["nodes", "addresses"])?;
    let mut out: Vec<NodeAddr> = Vec::with_capacity(items.len());
    for item in items {
        let address = match item {
            Value::String(s) => Some(s.trim()).filter(|s| !s.is_empty()),
            Value::Object(_) => str_field(item, &["address", "url", "endpoint"]),
            _ => None,
        };
        if let Some(address) = address {
            let addr = NodeAddr::new(address);
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
    }
    Ok(out)
}

/// Build an offering from a fetched listing. The listing must be JSON-LD
/// naming exactly one offering object; contracts, error pages and anything
/// else are rejected.
pub fn offering_from_listing(r: &OfferingRef, body: Vec<u8>) -> Result<Offering, FeedError> {
    let listing: Value = serde_json::from_slice(&body)
        .map_err(|e| FeedError::Invalid(format!("listing {} is not JSON: {}", r.address, e)))?;
    let derived = extract_offering_id(&listing).ok_or_else(|| {
        FeedError::Invalid(format!("listing {} does not describe a single offering", r.address))
    })?;
    let id = r.id.clone().unwrap_or(derived);
    Ok(Offering::new(id, body).with_source(r.address.clone()))
}

// ---------------------------------------------------------------------------
// FeedPoller
// ---------------------------------------------------------------------------

pub struct FeedPoller<C: NodeClient, F: RegistryFeed> {
    feed: Arc<F>,
    monitor: Arc<HealthMonitor<C>>,
    engine: Arc<DistributionEngine<C>>,
    pool: Arc<WorkerPool>,
    mode: DiscoveryMode,
    static_nodes: Vec<NodeAddr>,
    interval: Duration,
}

impl<C: NodeClient, F: RegistryFeed> std::fmt::Debug for FeedPoller<C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedPoller")
            .field("mode", &self.mode)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl<C: NodeClient, F: RegistryFeed> FeedPoller<C, F> {
    pub fn new(
        feed: Arc<F>,
        monitor: Arc<HealthMonitor<C>>,
        engine: Arc<DistributionEngine<C>>,
        pool: Arc<WorkerPool>,
        mode: DiscoveryMode,
        static_nodes: Vec<NodeAddr>,
        interval: Duration,
    ) -> Self {
        Self {
            feed,
            monitor,
            engine,
            pool,
            mode,
            static_nodes,
            interval,
        }
    }

    /// Refresh the node list from the feed in decentralized mode. Returns
    /// the number of newly registered nodes.
    ///
    /// Static mode registers its list once at bootstrap, so this is a no-op
    /// there and deregistered nodes stay gone. The static list is only used
    /// as a fallback when discovery leaves the registry empty.
    pub async fn sync_nodes(&self) -> usize {
        if self.mode != DiscoveryMode::Decentralized {
            return 0;
        }
        let mut added = 0;
        match self.feed.fetch_nodes().await {
            Ok(nodes) => {
                for node in nodes {
                    if self.monitor.register(node).await {
                        added += 1;
                    }
                }
            }
            Err(e) => {
                catalogue_metrics::metrics().feed_fetch_failures.inc();
                tracing::warn!("node discovery failed: {}", e);
            }
        }
        if !self.monitor.registry().snapshot().is_empty() {
            return added;
        }
        if !self.static_nodes.is_empty() {
            tracing::info!(
                "no nodes discovered; falling back to {} static node(s)",
                self.static_nodes.len()
            );
        }
        for node in &self.static_nodes {
            if self.monitor.register(node.clone()).await {
                added += 1;
            }
        }
        added
    }

    /// Fetch the offering list and every listing it names. Listings that
    /// fail to download or do not describe an offering are skipped.
    pub async fn fetch_offerings(&self) -> Result<Vec<Offering>, FeedError> {
        let refs = self.feed.fetch_offering_refs().await?;
        let offerings: Vec<Offering> = futures::stream::iter(refs)
            .map(|r| async move {
                let fetched = self.feed.fetch_listing(&r.address).await;
                match fetched.and_then(|body| offering_from_listing(&r, body)) {
                    Ok(offering) => Some(offering),
                    Err(e) => {
                        catalogue_metrics::metrics().feed_fetch_failures.inc();
                        tracing::warn!("fetching listing {} failed: {}", r.address, e);
                        None
                    }
                }
            })
            .buffer_unordered(LISTING_FETCH_CONCURRENCY)
            .filter_map(|o| async move { o })
            .collect()
            .await;
        Ok(offerings)
    }

    /// One poll: sync nodes, then distribute whatever the feed lists.
    pub async fn poll_once(&self) -> Option<BatchReport> {
        self.sync_nodes().await;
        let offerings = match self.fetch_offerings().await {
            Ok(offerings) => offerings,
            Err(e) => {
                catalogue_metrics::metrics().feed_fetch_failures.inc();
                tracing::warn!("offering feed fetch failed: {}", e);
                return None;
            }
        };
        if offerings.is_empty() {
            tracing::debug!("offering feed returned nothing");
            return None;
        }
        tracing::info!("fetched {} offering(s) from the registry", offerings.len());
        Some(self.engine.distribute_batch(&self.pool, offerings).await)
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = async {
                        tick.tick().await;
                        self.poll_once().await
                    } => {}
                }
            }
            tracing::info!("registry feed poller stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::DistributionOptions;
    use crate::health::HealthMonitorConfig;
    use crate::node_client::NodeError;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use catalogue_common::HealthState;
    use catalogue_ring::NodeRegistry;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_offering_refs_shapes() {
        let wrapped = json!({"addresses": ["http://dlt/o/1", " ", "http://dlt/o/2"]});
        let refs = parse_offering_refs(&wrapped).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].address, "http://dlt/o/1");
        assert!(refs[0].id.is_none());

        let objects = json!([{"id": "o9", "url": "http://dlt/o/9"}, {"name": "no address"}]);
        let refs = parse_offering_refs(&objects).unwrap();
        assert_eq!(
            refs,
            vec![OfferingRef {
                id: Some("o9".into()),
                address: "http://dlt/o/9".into()
            }]
        );

        assert!(parse_offering_refs(&json!({"unexpected": 1})).is_err());
        assert!(parse_offering_refs(&json!(42)).is_err());
    }

    #[test]
    fn test_parse_node_list_normalises() {
        let body = json!([
            "http://n1:3030/",
            {"id": "did:n2", "address": "http://n2:3030"},
            {"nodeId": "n3", "endpoint": "http://n3:3030"},
            "http://n1:3030",
            {"id": "no-address"}
        ]);
        let nodes = parse_node_list(&body).unwrap();
        assert_eq!(
            nodes,
            vec![
                NodeAddr::new("http://n1:3030"),
                NodeAddr::new("http://n2:3030"),
                NodeAddr::new("http://n3:3030"),
            ]
        );
        assert_eq!(parse_node_list(&json!({"nodes": ["http://a"]})).unwrap().len(), 1);
    }

    #[test]
    fn test_offering_from_listing_derives_id() {
        let r = OfferingRef {
            id: None,
            address: "http://dlt/o/1".into(),
        };
        let body = serde_json::to_vec(&json!({"@graph": [{"@id": "urn:o:1", "@type": "ServiceOffering"}]})).unwrap();
        let o = offering_from_listing(&r, body).unwrap();
        assert_eq!(o.id, "urn:o:1");
        assert_eq!(o.source.as_deref(), Some("http://dlt/o/1"));

        let named = OfferingRef {
            id: Some("o-listed".into()),
            address: "http://dlt/o/1".into(),
        };
        let body = serde_json::to_vec(&json!({"@id": "urn:o:1", "@type": "DataOffering"})).unwrap();
        assert_eq!(offering_from_listing(&named, body).unwrap().id, "o-listed");
    }

    #[test]
    fn test_offering_from_listing_rejects_non_offerings() {
        let r = OfferingRef {
            id: Some("o1".into()),
            address: "http://dlt/o/1".into(),
        };
        assert!(matches!(
            offering_from_listing(&r, b"<html>502 Bad Gateway</html>".to_vec()),
            Err(FeedError::Invalid(_))
        ));
        let contract = serde_json::to_vec(&json!({"@id": "urn:c:1", "@type": "gx:OfferingContract"})).unwrap();
        assert!(matches!(offering_from_listing(&r, contract), Err(FeedError::Invalid(_))));
        let untyped = serde_json::to_vec(&json!({"name": "x"})).unwrap();
        assert!(matches!(offering_from_listing(&r, untyped), Err(FeedError::Invalid(_))));
    }

    // -----------------------------------------------------------------------
    // Poller
    // -----------------------------------------------------------------------

    struct StaticFeed {
        nodes: Result<Vec<NodeAddr>, FeedError>,
        listings: HashMap<String, Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl RegistryFeed for StaticFeed {
        async fn fetch_offering_refs(&self) -> Result<Vec<OfferingRef>, FeedError> {
            let mut refs: Vec<OfferingRef> = self
                .listings
                .keys()
                .map(|a| OfferingRef {
                    id: None,
                    address: a.clone(),
                })
                .collect();
            refs.push(OfferingRef {
                id: None,
                address: "http://dlt/missing".into(),
            });
            Ok(refs)
        }

        async fn fetch_listing(&self, address: &str) -> Result<Vec<u8>, FeedError> {
            self.listings.get(address).cloned().ok_or(FeedError::Status(404))
        }

        async fn fetch_nodes(&self) -> Result<Vec<NodeAddr>, FeedError> {
            self.nodes.clone()
        }
    }

    struct AlwaysOk;

    #[async_trait::async_trait]
    impl NodeClient for AlwaysOk {
        async fn probe(&self, _node: &NodeAddr) -> Result<(), NodeError> {
            Ok(())
        }

        async fn push(&self, _node: &NodeAddr, _offering: &Offering) -> Result<(), NodeError> {
            Ok(())
        }

        async fn query(&self, _node: &NodeAddr, _query: &str) -> Result<Vec<Value>, NodeError> {
            Ok(vec![])
        }
    }

    fn poller(mode: DiscoveryMode, feed: StaticFeed, static_nodes: Vec<&str>) -> FeedPoller<AlwaysOk, StaticFeed> {
        let registry = Arc::new(NodeRegistry::new(16, HealthState::Healthy));
        let client = Arc::new(AlwaysOk);
        let (tx, _rx) = mpsc::channel(crate::health::EVENT_QUEUE_CAPACITY);
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            client.clone(),
            HealthMonitorConfig::default(),
            tx,
        ));
        let engine = Arc::new(DistributionEngine::new(
            registry,
            client,
            Arc::new(MemoryStore::new()),
            DistributionOptions {
                replicas: 2,
                retry: RetryPolicy::none(),
                push_timeout: Duration::from_secs(1),
            },
        ));
        FeedPoller::new(
            Arc::new(feed),
            monitor,
            engine,
            Arc::new(WorkerPool::new(2)),
            mode,
            static_nodes.into_iter().map(NodeAddr::new).collect(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_decentralized_registers_discovered_nodes() {
        let feed = StaticFeed {
            nodes: Ok(vec![NodeAddr::new("http://n1"), NodeAddr::new("http://n2")]),
            listings: HashMap::new(),
        };
        let p = poller(DiscoveryMode::Decentralized, feed, vec!["http://fallback"]);
        assert_eq!(p.sync_nodes().await, 2);
        assert_eq!(p.sync_nodes().await, 0);
        assert!(!p.monitor.registry().snapshot().contains(&NodeAddr::new("http://fallback")));
    }

    #[tokio::test]
    async fn test_decentralized_falls_back_to_static_list() {
        let feed = StaticFeed {
            nodes: Err(FeedError::Unreachable("refused".into())),
            listings: HashMap::new(),
        };
        let p = poller(DiscoveryMode::Decentralized, feed, vec!["http://fallback"]);
        assert_eq!(p.sync_nodes().await, 1);
        assert!(p.monitor.registry().snapshot().contains(&NodeAddr::new("http://fallback")));
    }

    #[tokio::test]
    async fn test_poll_once_distributes_fetched_listings() {
        let mut listings = HashMap::new();
        for i in 0..3 {
            let body = json!({"@id": format!("urn:o:{}", i), "@type": "DataOffering"});
            listings.insert(format!("http://dlt/o/{}", i), serde_json::to_vec(&body).unwrap());
        }
        listings.insert("http://dlt/o/error".into(), b"internal error".to_vec());
        let contract = json!({"@id": "urn:c:1", "@type": "OfferingContract"});
        listings.insert("http://dlt/o/contract".into(), serde_json::to_vec(&contract).unwrap());
        let feed = StaticFeed {
            nodes: Ok(vec![]),
            listings,
        };
        let p = poller(DiscoveryMode::Static, feed, vec![]);
        for n in ["http://n1", "http://n2", "http://n3"] {
            p.monitor.register(NodeAddr::new(n)).await;
        }
        let report = p.poll_once().await.unwrap();
        assert_eq!(report.distributed, 3);
        assert!(report.failed.is_empty());
        assert!(p.engine.placement("urn:o:2").await.unwrap().is_some());
        assert!(p.engine.placement("urn:c:1").await.unwrap().is_none());
        assert_eq!(p.engine.load_assignments().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_static_poll_keeps_deregistered_node_out() {
        let feed = StaticFeed {
            nodes: Ok(vec![]),
            listings: HashMap::new(),
        };
        let p = poller(DiscoveryMode::Static, feed, vec!["http://n1", "http://n2"]);
        for n in ["http://n1", "http://n2"] {
            p.monitor.register(NodeAddr::new(n)).await;
        }
        assert!(p.monitor.deregister(&NodeAddr::new("http://n1")).await);

        assert_eq!(p.sync_nodes().await, 0);
        p.poll_once().await;
        let snapshot = p.monitor.registry().snapshot();
        assert!(!snapshot.contains(&NodeAddr::new("http://n1")));
        assert!(snapshot.contains(&NodeAddr::new("http://n2")));
    }
}
