//! Storage engine: WAL + memtable.
//!
//! Every write is appended to the WAL before it is applied to the memtable.

use crate::memtable::Memtable;
use crate::record::StorageRecord;
use crate::wal::{FsyncPolicy, Wal, WalError};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous key-value engine. Callers in async code wrap it in a lock and
/// keep critical sections short.
#[derive(Debug)]
pub struct StorageEngine {
    memtable: Memtable,
    wal: Wal,
    /// Number of WAL entries that no longer describe a live value.
    garbage: u64,
}

impl StorageEngine {
    /// Open (or create) the engine under `data_dir`, replaying its WAL.
    pub fn open(data_dir: &Path, fsync: FsyncPolicy) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join("state.wal");

        let records = Wal::recover(&wal_path)?;
        let replayed = records.len() as u64;
        let mut memtable = Memtable::new();
        for record in records {
            memtable.apply(record);
        }
        let garbage = replayed.saturating_sub(memtable.len() as u64);

        let wal = Wal::open(&wal_path, fsync)?;
        tracing::info!(
            "storage engine opened: {} keys recovered from {} WAL entries at {:?}",
            memtable.len(),
            replayed,
            wal_path
        );

        Ok(Self {
            memtable,
            wal,
            garbage,
        })
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.memtable.get(key).map(|r| r.value.clone())
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let record = StorageRecord::new(key, value);
        self.wal.append(&record)?;
        if self.memtable.get(key).is_some() {
            self.garbage += 1;
        }
        self.memtable.apply(record);
        Ok(())
    }

    /// Delete a key. Returns whether it existed.
    pub fn delete(&mut self, key: &str) -> Result<bool, StorageError> {
        if self.memtable.get(key).is_none() {
            return Ok(false);
        }
        self.wal.append(&StorageRecord::delete(key))?;
        self.memtable.remove(key);
        self.garbage += 2;
        Ok(true)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.memtable.keys_with_prefix(prefix)
    }

    pub fn key_count(&self) -> usize {
        self.memtable.len()
    }

    /// WAL entries that compaction would drop.
    pub fn garbage_entries(&self) -> u64 {
        self.garbage
    }

    /// Rewrite the WAL so it holds one entry per live key.
    pub fn compact(&mut self) -> Result<(), StorageError> {
        let before = self.garbage;
        self.wal.rewrite(self.memtable.records())?;
        self.garbage = 0;
        tracing::debug!(
            "WAL compacted: dropped {} stale entries, {} live keys",
            before,
            self.memtable.len()
        );
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.wal.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_engine_put_get() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();
        engine.put("k1", b"v1".to_vec()).unwrap();
        assert_eq!(engine.get("k1"), Some(b"v1".to_vec()));
        assert_eq!(engine.get("k2"), None);
    }

    #[test]
    fn test_engine_recovers_last_write() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
            engine.put("k1", b"v1".to_vec()).unwrap();
            engine.put("k1", b"v2".to_vec()).unwrap();
            engine.put("k2", b"x".to_vec()).unwrap();
        }
        let engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
        assert_eq!(engine.key_count(), 2);
        assert_eq!(engine.get("k1"), Some(b"v2".to_vec()));
        assert_eq!(engine.garbage_entries(), 1);
    }

    #[test]
    fn test_engine_delete_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
            engine.put("k1", b"v1".to_vec()).unwrap();
            engine.put("k2", b"v2".to_vec()).unwrap();
            assert!(engine.delete("k1").unwrap());
            assert!(!engine.delete("missing").unwrap());
        }
        let engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
        assert_eq!(engine.get("k1"), None);
        assert_eq!(engine.get("k2"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_engine_writes_after_torn_tail_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
            engine.put("a", b"1".to_vec()).unwrap();
            engine.put("b", b"2".to_vec()).unwrap();
        }
        {
            let wal_path = dir.path().join("state.wal");
            let file = std::fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 4).unwrap();
        }
        {
            let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
            assert_eq!(engine.get("a"), Some(b"1".to_vec()));
            assert_eq!(engine.get("b"), None);
            engine.put("c", b"3".to_vec()).unwrap();
        }
        let engine = StorageEngine::open(dir.path(), FsyncPolicy::Always).unwrap();
        assert_eq!(engine.get("a"), Some(b"1".to_vec()));
        assert_eq!(engine.get("c"), Some(b"3".to_vec()));
    }

    #[test]
    fn test_engine_prefix_keys() {
        let dir = TempDir::new().unwrap();
        let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();
        engine.put("catalogue:assignment:a", vec![]).unwrap();
        engine.put("catalogue:assignment:b", vec![]).unwrap();
        engine.put("catalogue:nodes", vec![]).unwrap();
        assert_eq!(
            engine.keys_with_prefix("catalogue:assignment:"),
            vec!["catalogue:assignment:a", "catalogue:assignment:b"]
        );
    }

    #[test]
    fn test_engine_compact_keeps_live_keys() {
        let dir = TempDir::new().unwrap();
        {
            let mut engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();
            for i in 0..10 {
                engine.put("hot", format!("v{}", i).into_bytes()).unwrap();
            }
            engine.put("gone", vec![1]).unwrap();
            engine.delete("gone").unwrap();
            assert_eq!(engine.garbage_entries(), 11);
            engine.compact().unwrap();
            assert_eq!(engine.garbage_entries(), 0);
            engine.put("after", vec![2]).unwrap();
        }
        let engine = StorageEngine::open(dir.path(), FsyncPolicy::None).unwrap();
        assert_eq!(engine.key_count(), 2);
        assert_eq!(engine.get("hot"), Some(b"v9".to_vec()));
        assert_eq!(engine.get("after"), Some(vec![2]));
        assert_eq!(engine.garbage_entries(), 0);
    }
}
