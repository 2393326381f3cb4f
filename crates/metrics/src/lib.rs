//! Metrics and tracing setup for the catalogue coordinator.
//!
//! A global [`CatalogueMetrics`] singleton backed by `prometheus`, plus a
//! small HTTP/1.1 server exposing it for scraping.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<CatalogueMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static CatalogueMetrics {
    METRICS.get_or_init(CatalogueMetrics::new)
}

pub struct CatalogueMetrics {
    pub registry: Registry,

    // ── Topology ──
    pub ring_version: IntGauge,
    pub nodes_by_health: IntGaugeVec,

    // ── Health probes ──
    pub probes_total: IntCounter,
    pub probes_failed: IntCounter,
    pub health_transitions: IntCounterVec,
    pub probe_latency_secs: Histogram,

    // ── Distribution ──
    pub pushes_total: IntCounter,
    pub pushes_failed: IntCounter,
    pub push_retries: IntCounter,
    pub push_latency_secs: Histogram,
    pub offerings_distributed: IntCounter,
    pub offerings_failed: IntCounter,
    pub under_replicated: IntCounter,

    // ── Failover ──
    pub failover_passes: IntCounter,
    pub failover_reassignments: IntCounter,

    // ── Federation ──
    pub federated_queries: IntCounter,
    pub federation_node_failures: IntCounter,
    pub query_latency_secs: Histogram,

    // ── Upstream feed ──
    pub feed_fetch_failures: IntCounter,
}

impl std::fmt::Debug for CatalogueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogueMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for probe/push/query latency.
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("metric registered once");
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts");
    registry
        .register(Box::new(c.clone()))
        .expect("metric registered once");
    c
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()))
        .expect("valid histogram opts");
    registry
        .register(Box::new(h.clone()))
        .expect("metric registered once");
    h
}

impl CatalogueMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let ring_version = IntGauge::with_opts(Opts::new(
            "catalogue_ring_version",
            "Version of the current hash ring snapshot",
        ))
        .expect("ring_version gauge");
        registry
            .register(Box::new(ring_version.clone()))
            .expect("register ring_version");

        let nodes_by_health = IntGaugeVec::new(
            Opts::new("catalogue_nodes", "Known catalogue nodes, by health state"),
            &["health"],
        )
        .expect("nodes gauge vec");
        registry
            .register(Box::new(nodes_by_health.clone()))
            .expect("register nodes_by_health");

        Self {
            probes_total: counter(&registry, "catalogue_probes_total", "Health probes sent"),
            probes_failed: counter(
                &registry,
                "catalogue_probes_failed_total",
                "Health probes that failed or timed out",
            ),
            health_transitions: counter_vec(
                &registry,
                "catalogue_health_transitions_total",
                "Node health transitions, by target state",
                &["to"],
            ),
            probe_latency_secs: histogram(
                &registry,
                "catalogue_probe_latency_seconds",
                "Health probe latency in seconds",
            ),
            pushes_total: counter(&registry, "catalogue_pushes_total", "Offering push attempts"),
            pushes_failed: counter(
                &registry,
                "catalogue_pushes_failed_total",
                "Offering pushes that exhausted their retries",
            ),
            push_retries: counter(
                &registry,
                "catalogue_push_retries_total",
                "Push attempts beyond the first",
            ),
            push_latency_secs: histogram(
                &registry,
                "catalogue_push_latency_seconds",
                "Single push attempt latency in seconds",
            ),
            offerings_distributed: counter(
                &registry,
                "catalogue_offerings_distributed_total",
                "Offerings placed on at least one node",
            ),
            offerings_failed: counter(
                &registry,
                "catalogue_offerings_failed_total",
                "Offerings that could not be placed on any node",
            ),
            under_replicated: counter(
                &registry,
                "catalogue_under_replicated_total",
                "Assignments recorded with fewer nodes than the replica target",
            ),
            failover_passes: counter(
                &registry,
                "catalogue_failover_passes_total",
                "Failover passes triggered by node loss",
            ),
            failover_reassignments: counter(
                &registry,
                "catalogue_failover_reassignments_total",
                "Assignments recomputed by failover",
            ),
            federated_queries: counter(
                &registry,
                "catalogue_federated_queries_total",
                "Federated queries executed",
            ),
            federation_node_failures: counter(
                &registry,
                "catalogue_federation_node_failures_total",
                "Per-node query failures and timeouts",
            ),
            query_latency_secs: histogram(
                &registry,
                "catalogue_query_latency_seconds",
                "Federated query latency in seconds",
            ),
            feed_fetch_failures: counter(
                &registry,
                "catalogue_feed_fetch_failures_total",
                "Failed fetches from the upstream registry feed",
            ),
            ring_version,
            nodes_by_health,
            registry,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&metrics().registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = if req.method() == Method::GET && req.uri().path() == "/metrics" {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(encode_metrics())))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
    };
    Ok(response.expect("valid HTTP response"))
}

/// Serve Prometheus metrics on `addr` (`GET /metrics`) until the listener
/// fails. Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
