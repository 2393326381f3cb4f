//! reqwest client for the upstream registry feed.

use catalogue_common::NodeAddr;
use catalogue_config::RegistryConfig;
use catalogue_coord::feed::{parse_node_list, parse_offering_refs, FeedError, OfferingRef, RegistryFeed};
use serde_json::Value;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpRegistryFeed {
    http: reqwest::Client,
    base_url: String,
    offerings_path: String,
    nodes_path: String,
}

impl HttpRegistryFeed {
    pub fn new(config: &RegistryConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            offerings_path: config.offerings_path.clone(),
            nodes_path: config.nodes_path.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FeedError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FeedError::Unreachable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn get_json(&self, url: &str) -> Result<Value, FeedError> {
        let bytes = self.get_bytes(url).await?;
        serde_json::from_slice(&bytes).map_err(|e| FeedError::Invalid(e.to_string()))
    }
}

#[async_trait::async_trait]
impl RegistryFeed for HttpRegistryFeed {
    async fn fetch_offering_refs(&self) -> Result<Vec<OfferingRef>, FeedError> {
        let body = self.get_json(&self.url(&self.offerings_path)).await?;
        parse_offering_refs(&body)
    }

    async fn fetch_listing(&self, address: &str) -> Result<Vec<u8>, FeedError> {
        // Relative addresses are resolved against the registry base.
        if address.starts_with("http://") || address.starts_with("https://") {
            self.get_bytes(address).await
        } else {
            self.get_bytes(&self.url(address)).await
        }
    }

    async fn fetch_nodes(&self) -> Result<Vec<NodeAddr>, FeedError> {
        let body = self.get_json(&self.url(&self.nodes_path)).await?;
        parse_node_list(&body)
    }
}
