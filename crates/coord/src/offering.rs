//! Offerings and their replica assignments.

use catalogue_common::{now_ms, NodeAddr};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of catalogue content. Immutable: a re-fetch produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offering {
    pub id: String,
    pub content: Vec<u8>,
    pub fetched_at_ms: u64,
    /// Address the listing was fetched from, if it came from the feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Offering {
    pub fn new(id: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            fetched_at_ms: now_ms(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Where an offering currently lives.
///
/// `nodes` holds only nodes that acknowledged a push, in ring order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaAssignment {
    pub offering_id: String,
    pub nodes: Vec<NodeAddr>,
    /// Ring version the placement was computed under.
    pub ring_version: u64,
    /// Replica target at the time of placement.
    pub target_replicas: usize,
    pub under_replicated: bool,
    pub updated_at_ms: u64,
}

impl ReplicaAssignment {
    pub fn new(
        offering_id: impl Into<String>,
        nodes: Vec<NodeAddr>,
        ring_version: u64,
        target_replicas: usize,
    ) -> Self {
        debug_assert!(
            nodes
                .iter()
                .enumerate()
                .all(|(i, n)| !nodes[..i].contains(n)),
            "duplicate node in assignment: {:?}",
            nodes
        );
        Self {
            offering_id: offering_id.into(),
            under_replicated: nodes.len() < target_replicas,
            nodes,
            ring_version,
            target_replicas,
            updated_at_ms: now_ms(),
        }
    }

    pub fn contains(&self, node: &NodeAddr) -> bool {
        self.nodes.contains(node)
    }
}

// ---------------------------------------------------------------------------
// Offering id derivation
// ---------------------------------------------------------------------------

fn type_names(obj: &Value) -> Vec<&str> {
    match obj.get("@type") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn is_offering(obj: &Value) -> bool {
    let types = type_names(obj);
    types.iter().any(|t| t.contains("Offering"))
        && !types.iter().any(|t| t.contains("OfferingContract"))
}

/// The `@id` of the single offering object in a JSON-LD listing.
///
/// Looks in `@graph` when present, otherwise at the listing itself (or its
/// elements, if it is an array). Returns `None` unless exactly one object
/// qualifies.
pub fn extract_offering_id(listing: &Value) -> Option<String> {
    let candidates: Vec<&Value> = match listing {
        Value::Array(items) => items.iter().collect(),
        _ => match listing.get("@graph") {
            Some(Value::Array(graph)) => graph.iter().collect(),
            Some(obj @ Value::Object(_)) => vec![obj],
            _ => vec![listing],
        },
    };

    let mut ids = candidates
        .into_iter()
        .filter(|obj| is_offering(obj))
        .filter_map(|obj| obj.get("@id").and_then(Value::as_str));

    match (ids.next(), ids.next()) {
        (Some(id), None) => Some(id.to_string()),
        _ => None,
    }
}
