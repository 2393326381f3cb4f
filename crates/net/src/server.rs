//! Public HTTP API.
//!
//! Routing is a plain async function over `(method, path, body)` so it can
//! be exercised without a socket; `serve_api` wraps it in a hyper http1
//! server.

use bytes::Bytes;
use catalogue_common::HealthState;
use catalogue_coord::{Coordinator, DistributionError, FederationError, NodeClient, Offering};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    fn into_http(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body.to_string())));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        response
    }
}

/// Dispatch one request.
pub async fn route<C: NodeClient>(coord: &Coordinator<C>, method: &Method, path: &str, body: &[u8]) -> ApiResponse {
    match (method, path) {
        (&Method::GET, "/health") => health(coord),
        (&Method::GET, "/nodes") => nodes(coord),
        (&Method::POST, "/offerings") => offerings(coord, body).await,
        (&Method::POST, "/sparql") => sparql(coord, body).await,
        (_, "/health" | "/nodes" | "/offerings" | "/sparql") => {
            ApiResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => ApiResponse::error(StatusCode::NOT_FOUND, "not found"),
    }
}

fn health<C: NodeClient>(coord: &Coordinator<C>) -> ApiResponse {
    let snapshot = coord.registry().snapshot();
    ApiResponse::ok(json!({
        "status": "ok",
        "ring_version": snapshot.ring_version(),
        "healthy_nodes": snapshot.count(HealthState::Healthy),
    }))
}

fn nodes<C: NodeClient>(coord: &Coordinator<C>) -> ApiResponse {
    let snapshot = coord.registry().snapshot();
    let nodes: Vec<Value> = snapshot
        .to_vec()
        .iter()
        .map(|n| {
            json!({
                "address": n.address,
                "health": n.health,
                "last_seen_ms": n.last_seen_ms,
                "consecutive_failures": n.consecutive_failures,
                "in_ring": snapshot.ring().contains(&n.address),
            })
        })
        .collect();
    ApiResponse::ok(json!({
        "ring_version": snapshot.ring_version(),
        "nodes": nodes,
    }))
}

async fn offerings<C: NodeClient>(coord: &Coordinator<C>, body: &[u8]) -> ApiResponse {
    let request: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return ApiResponse::error(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)),
    };
    let Some(offering_id) = request
        .get("offeringId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return ApiResponse::error(StatusCode::BAD_REQUEST, "missing offeringId");
    };

    if let Some(content) = request.get("content") {
        let bytes = match content {
            Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        };
        return match coord.submit(Offering::new(offering_id, bytes)).await {
            Ok(report) => ApiResponse::ok(json!(report)),
            Err(e @ DistributionError::NoAvailableNodes { .. }) => {
                ApiResponse::error(StatusCode::BAD_GATEWAY, e.to_string())
            }
            Err(DistributionError::AllPushesFailed { offering_id, failed_nodes }) => ApiResponse {
                status: StatusCode::BAD_GATEWAY,
                body: json!({
                    "error": format!("all pushes failed for offering {}", offering_id),
                    "failedNodes": failed_nodes,
                }),
            },
            Err(e @ DistributionError::Pool(_)) => {
                ApiResponse::error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            Err(e @ DistributionError::Store(_)) => {
                ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
    }

    match coord.placement(offering_id).await {
        Ok(Some(assignment)) => ApiResponse::ok(json!(assignment)),
        Ok(None) => ApiResponse::error(StatusCode::NOT_FOUND, format!("unknown offering {}", offering_id)),
        Err(e) => ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// The query text from a `{"query": ...}` body, or the raw body.
fn query_text(body: &[u8]) -> Option<String> {
    let text = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(obj)) => obj.get("query")?.as_str()?.to_string(),
        _ => String::from_utf8_lossy(body).into_owned(),
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

async fn sparql<C: NodeClient>(coord: &Coordinator<C>, body: &[u8]) -> ApiResponse {
    let Some(query) = query_text(body) else {
        return ApiResponse::error(StatusCode::BAD_REQUEST, "missing query");
    };
    match coord.federate(&query).await {
        Ok(result) => ApiResponse::ok(json!(result)),
        Err(e @ FederationError::NoHealthyNodes) => {
            ApiResponse::error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(FederationError::AllNodesFailed { attempted, failed_nodes }) => ApiResponse {
            status: StatusCode::BAD_GATEWAY,
            body: json!({
                "error": format!("all {} node(s) failed to answer", attempted),
                "results": [],
                "failedNodes": failed_nodes,
                "respondedNodes": [],
            }),
        },
    }
}

async fn handle<C: NodeClient>(
    coord: Arc<Coordinator<C>>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(ApiResponse::error(StatusCode::BAD_REQUEST, format!("unreadable body: {}", e)).into_http());
        }
    };
    let response = route(&coord, &method, &path, &body).await;
    tracing::debug!("{} {} -> {}", method, path, response.status);
    Ok(response.into_http())
}

/// Serve the public API on `addr` until `shutdown` flips.
pub async fn serve_api<C: NodeClient>(
    addr: SocketAddr,
    coord: Arc<Coordinator<C>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("api server listening on http://{}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let coord = coord.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(coord.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!("api connection error: {}", e);
            }
        });
    }

    tracing::info!("api server stopped");
    Ok(())
}
