//! catalogue-common: shared types for the catalogue coordinator.
//!
//! Provides the `NodeAddr` identity used for catalogue nodes, the
//! `HealthState` enum driven by the health monitor, and the deterministic
//! 64-bit hash that places both keys and virtual nodes on the ring.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

// ---------------------------------------------------------------------------
// NodeAddr
// ---------------------------------------------------------------------------

/// Base address of a catalogue node, e.g. `http://localhost:3030`.
///
/// The address doubles as the node's identity: registration, ring placement
/// and persistence are all keyed by it. Trailing slashes are stripped so
/// `http://a/` and `http://a` name the same node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeAddr(String);

impl NodeAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        let raw: String = addr.into();
        let trimmed = raw.trim().trim_end_matches('/');
        Self(trimmed.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join a path (`/health`, `/update`, ...) onto this base address.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.0, path)
        } else {
            format!("{}/{}", self.0, path)
        }
    }
}

impl From<String> for NodeAddr {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for NodeAddr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<NodeAddr> for String {
    fn from(addr: NodeAddr) -> Self {
        addr.0
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddr({})", self.0)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// HealthState
// ---------------------------------------------------------------------------

/// Liveness of a catalogue node as seen by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Suspect,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Suspect => "suspect",
            HealthState::Down => "down",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ring hashing
// ---------------------------------------------------------------------------

/// Hash arbitrary bytes onto the 64-bit ring.
///
/// Uses the first 8 bytes of the SHA-1 digest, big-endian, so placement is
/// stable across processes, platforms and releases.
pub fn ring_hash(data: &[u8]) -> u64 {
    let digest = Sha1::digest(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Hash of the `index`-th virtual point of a node (`"<addr>-<index>"`).
pub fn virtual_point_hash(addr: &NodeAddr, index: usize) -> u64 {
    ring_hash(format!("{}-{}", addr.as_str(), index).as_bytes())
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
