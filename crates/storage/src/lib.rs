//! Durable key-value engine backing the coordinator's state store.
//!
//! Records are `{key, value, deleted, timestamp}` with last-write-wins
//! semantics. The WAL provides durability; the memtable provides fast reads
//! and prefix scans.

pub mod engine;
pub mod memtable;
pub mod record;
pub mod wal;

pub use engine::{StorageEngine, StorageError};
pub use record::StorageRecord;
pub use wal::FsyncPolicy;
