//! reqwest client implementing `NodeClient`.
//!
//! Speaks the catalogue node contract: a liveness GET, an idempotent push
//! keyed by offering id, and a SPARQL-style query endpoint whose answer is
//! normalised to a list of rows.

use catalogue_common::NodeAddr;
use catalogue_config::NodeApiConfig;
use catalogue_coord::{NodeClient, NodeError, Offering};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use tokio::time::Duration;

const SPARQL_QUERY: &str = "application/sparql-query";
const SPARQL_RESULTS: &str = "application/sparql-results+json";

#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    http: reqwest::Client,
    api: NodeApiConfig,
}

impl HttpNodeClient {
    /// `request_timeout` caps every call; the health monitor and the
    /// distribution engine apply their own, tighter, timeouts on top.
    pub fn new(api: NodeApiConfig, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, api })
    }

    fn endpoint(&self, node: &NodeAddr, path: &str) -> Result<Url, NodeError> {
        Url::parse(&node.url(path))
            .map_err(|e| NodeError::Unreachable(format!("invalid node address {}: {}", node, e)))
    }
}

fn send_error(e: reqwest::Error) -> NodeError {
    if e.is_timeout() {
        NodeError::Timeout
    } else {
        NodeError::Unreachable(e.to_string())
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), NodeError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NodeError::Status(status.as_u16()))
    }
}

/// Rows of a query answer: `results.bindings` when present, otherwise a
/// top-level array, otherwise the whole document as one row.
pub fn result_rows(body: Value) -> Vec<Value> {
    match body {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => {
            let bindings = obj
                .get_mut("results")
                .and_then(|r| r.get_mut("bindings"))
                .map(Value::take);
            match bindings {
                Some(Value::Array(rows)) => rows,
                _ => vec![Value::Object(obj)],
            }
        }
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait::async_trait]
impl NodeClient for HttpNodeClient {
    async fn probe(&self, node: &NodeAddr) -> Result<(), NodeError> {
        let url = self.endpoint(node, &self.api.health_path)?;
        let response = self.http.get(url).send().await.map_err(send_error)?;
        check_status(&response)
    }

    async fn push(&self, node: &NodeAddr, offering: &Offering) -> Result<(), NodeError> {
        let mut url = self.endpoint(node, &self.api.push_path)?;
        url.query_pairs_mut().append_pair("offeringId", &offering.id);
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, self.api.push_content_type.as_str())
            .body(offering.content.clone())
            .send()
            .await
            .map_err(send_error)?;
        check_status(&response)
    }

    async fn query(&self, node: &NodeAddr, query: &str) -> Result<Vec<Value>, NodeError> {
        let url = self.endpoint(node, &self.api.query_path)?;
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, SPARQL_QUERY)
            .header(ACCEPT, SPARQL_RESULTS)
            .body(query.to_string())
            .send()
            .await
            .map_err(send_error)?;
        check_status(&response)?;

        let bytes = response.bytes().await.map_err(send_error)?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        Ok(result_rows(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_from_sparql_bindings() {
        let body = json!({
            "head": {"vars": ["s"]},
            "results": {"bindings": [{"s": {"type": "uri", "value": "urn:a"}}, {"s": {"type": "uri", "value": "urn:b"}}]}
        });
        assert_eq!(result_rows(body).len(), 2);
    }

    #[test]
    fn test_rows_from_array_and_document() {
        assert_eq!(result_rows(json!([1, 2, 3])).len(), 3);
        assert_eq!(result_rows(json!({"boolean": true})), vec![json!({"boolean": true})]);
        assert!(result_rows(Value::Null).is_empty());
    }

    #[test]
    fn test_bad_address_is_unreachable() {
        let client = HttpNodeClient::new(NodeApiConfig::default(), Duration::from_secs(1)).unwrap();
        let err = client.endpoint(&NodeAddr::new("not a url"), "/health").unwrap_err();
        assert!(matches!(err, NodeError::Unreachable(_)));
    }
}
