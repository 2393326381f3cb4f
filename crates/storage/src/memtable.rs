//! In-memory table for fast key lookups and ordered prefix scans.

use crate::record::StorageRecord;
use std::collections::BTreeMap;

/// Last-write-wins key-value table.
///
/// Keys are kept ordered so prefix scans (`catalogue:assignment:*`) are a
/// range walk instead of a full scan.
#[derive(Debug, Default)]
pub struct Memtable {
    data: BTreeMap<String, StorageRecord>,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&StorageRecord> {
        self.data.get(key)
    }

    /// Apply a record. Delete markers remove the key; anything else
    /// replaces the current value.
    pub fn apply(&mut self, record: StorageRecord) {
        if record.deleted {
            self.data.remove(&record.key);
        } else {
            self.data.insert(record.key.clone(), record);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<StorageRecord> {
        self.data.remove(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Iterate live records in key order (used by WAL compaction).
    pub fn records(&self) -> impl Iterator<Item = &StorageRecord> {
        self.data.values()
    }
}
