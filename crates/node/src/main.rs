//! catalogue-node: entry point for the catalogue coordinator.
//!
//! Loads config, applies environment overrides, wires the coordinator over
//! the HTTP node client, then serves the public API until Ctrl+C.

use catalogue_coord::Coordinator;
use catalogue_net::{HttpNodeClient, HttpRegistryFeed};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    catalogue_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let mut config =
        catalogue_config::load_from_file(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            catalogue_config::CoordinatorConfig::default()
        });
    config.apply_env(|k| std::env::var(k).ok())?;
    config.validate()?;

    tracing::info!(
        "replicas={} virtual_nodes={} pool={} check_interval={}s grace={}s",
        config.ring.replicas,
        config.ring.virtual_nodes,
        config.distribution.worker_pool_size,
        config.health.check_interval_secs,
        config.health.grace_period_secs
    );

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = catalogue_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // The monitor and the engine apply tighter per-call timeouts.
    let request_timeout = Duration::from_millis(
        config
            .distribution
            .push_timeout_ms
            .max(config.federation.node_timeout_ms),
    );
    let client = Arc::new(HttpNodeClient::new(config.node_api.clone(), request_timeout)?);
    let feed = Arc::new(HttpRegistryFeed::new(&config.registry)?);
    let listen = config.listen;

    let coord = Arc::new(Coordinator::from_config(config, client));
    coord.bootstrap().await;
    coord.start();
    coord.start_feed(feed);

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(catalogue_net::serve_api(listen, coord.clone(), stop_rx));

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("api server failed: {}", e),
                Err(e) => tracing::error!("api server task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
            let _ = stop_tx.send(true);
        }
    }

    coord.shutdown().await;
    Ok(())
}
