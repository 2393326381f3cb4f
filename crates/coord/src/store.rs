//! Persistence adapter for coordinator state.
//!
//! The coordinator is a cache, not a system of record: everything stored
//! here can be rebuilt from the registry feed. Two backends implement
//! [`StateStore`]; callers only ever see `Arc<dyn StateStore>`.

use catalogue_storage::{FsyncPolicy, StorageEngine, StorageError};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::sync::RwLock;

/// Node list plus health snapshot.
pub const NODES_KEY: &str = "catalogue:nodes";
/// `catalogue:assignment:<offering_id>` -> `ReplicaAssignment`.
pub const ASSIGNMENT_PREFIX: &str = "catalogue:assignment:";
/// `catalogue:offering:<offering_id>` -> `Offering` (content cache).
pub const OFFERING_PREFIX: &str = "catalogue:offering:";

pub fn assignment_key(offering_id: &str) -> String {
    format!("{}{}", ASSIGNMENT_PREFIX, offering_id)
}

pub fn offering_key(offering_id: &str) -> String {
    format!("{}{}", OFFERING_PREFIX, offering_id)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Key-value contract the engine relies on. Writes to different keys must
/// not block each other.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Force buffered writes to durable storage. No-op for volatile stores.
    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.put(key, serde_json::to_vec(value)?).await
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Volatile store on a sharded concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// EngineStore
// ---------------------------------------------------------------------------

/// Stale WAL entries tolerated before a put triggers compaction.
const COMPACT_MIN_GARBAGE: u64 = 10_000;

/// Durable store on the WAL-backed storage engine.
#[derive(Debug)]
pub struct EngineStore {
    engine: RwLock<StorageEngine>,
}

impl EngineStore {
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StoreError> {
        let engine = StorageEngine::open(data_dir, fsync)?;
        Ok(Self {
            engine: RwLock::new(engine),
        })
    }
}

#[async_trait::async_trait]
impl StateStore for EngineStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.engine.read().await.get(key))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut engine = self.engine.write().await;
        engine.put(key, value)?;
        let garbage = engine.garbage_entries();
        if garbage >= COMPACT_MIN_GARBAGE && garbage > 4 * engine.key_count() as u64 {
            engine.compact()?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.engine.write().await.delete(key)?)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.engine.read().await.keys_with_prefix(prefix))
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(self.engine.write().await.sync()?)
    }

    fn backend(&self) -> &'static str {
        "wal"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
