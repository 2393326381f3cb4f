//! Storage record format.

use serde::{Deserialize, Serialize};

/// A single key-value write, as persisted in the WAL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageRecord {
    pub key: String,
    /// Value bytes (empty when `deleted`).
    pub value: Vec<u8>,
    /// Delete marker. Replay drops the key when it sees one.
    #[serde(default)]
    pub deleted: bool,
    /// Wall-clock timestamp (millis since epoch).
    pub timestamp_ms: u64,
}

impl StorageRecord {
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            deleted: false,
            timestamp_ms: catalogue_common::now_ms(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            deleted: true,
            timestamp_ms: catalogue_common::now_ms(),
        }
    }
}
