//! Write-ahead log.
//!
//! Entry layout: `[crc32 LE u32][len LE u32][JSON record]\n`. Replay stops at
//! the first truncated or corrupt entry; everything before it is kept, and
//! [`Wal::recover`] cuts the bad tail off so new appends are replayable.

use crate::record::StorageRecord;
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// When the WAL forces data to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// After every append.
    Always,
    /// Only on explicit `sync()`.
    Batch,
    /// Leave it to the OS.
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

fn encode_entry(record: &StorageRecord) -> Result<Vec<u8>, WalError> {
    let payload = serde_json::to_vec(record)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(payload.len() + 9);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.push(b'\n');
    Ok(buf)
}

/// Outcome of reading one entry during replay.
enum Entry {
    /// A record and the number of bytes its entry occupies.
    Record(StorageRecord, u64),
    Eof,
    Torn,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_entry<R: Read>(reader: &mut R, index: u64) -> Result<Entry, WalError> {
    let mut header = [0u8; 8];
    // A clean EOF can only happen on an entry boundary.
    let mut first = [0u8; 1];
    if !read_exact_or_eof(reader, &mut first)? {
        return Ok(Entry::Eof);
    }
    header[0] = first[0];
    if !read_exact_or_eof(reader, &mut header[1..])? {
        return Ok(Entry::Torn);
    }
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let mut payload = vec![0u8; len + 1];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(Entry::Torn);
    }
    payload.truncate(len);

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != expected {
        tracing::warn!(
            "WAL CRC mismatch at entry {}: expected {:#010x}, got {:#010x}",
            index,
            expected,
            actual
        );
        return Ok(Entry::Torn);
    }

    // An intact frame whose payload does not parse is treated as torn.
    match serde_json::from_slice(&payload) {
        Ok(record) => Ok(Entry::Record(record, 8 + len as u64 + 1)),
        Err(e) => {
            tracing::warn!("WAL entry {} does not decode: {}", index, e);
            Ok(Entry::Torn)
        }
    }
}

/// An append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            entries_written: 0,
        })
    }

    pub fn append(&mut self, record: &StorageRecord) -> Result<(), WalError> {
        let entry = encode_entry(record)?;
        self.writer.write_all(&entry)?;
        self.writer.flush()?;
        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }
        self.entries_written += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Entries appended since this handle was opened.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Replace the log with exactly `records`, then reopen for appends.
    ///
    /// Writes to a sibling temp file and renames it over the log so a crash
    /// mid-rewrite leaves either the old or the new log, never a mix.
    pub fn rewrite<'a, I>(&mut self, records: I) -> Result<(), WalError>
    where
        I: IntoIterator<Item = &'a StorageRecord>,
    {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in records {
                tmp.write_all(&encode_entry(record)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.entries_written = 0;
        Ok(())
    }

    /// Replay every intact entry from the log at `path`, in write order.
    pub fn replay(path: &Path) -> Result<Vec<StorageRecord>, WalError> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay the log and cut off any torn tail, so later appends land
    /// directly after the last intact entry.
    pub fn recover(path: &Path) -> Result<Vec<StorageRecord>, WalError> {
        let (records, valid_len, torn) = Self::scan(path)?;
        if torn {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                "WAL {:?} truncated to {} bytes after {} intact entries",
                path,
                valid_len,
                records.len()
            );
        }
        Ok(records)
    }

    /// Intact records, the byte length they span, and whether a torn or
    /// corrupt entry follows them.
    fn scan(path: &Path) -> Result<(Vec<StorageRecord>, u64, bool), WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((vec![], 0, false)),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;
        loop {
            match read_entry(&mut reader, records.len() as u64)? {
                Entry::Record(r, size) => {
                    records.push(r);
                    valid_len += size;
                }
                Entry::Eof => return Ok((records, valid_len, false)),
                Entry::Torn => {
                    tracing::warn!(
                        "WAL {:?} has a torn tail after {} entries; stopping replay",
                        path,
                        records.len()
                    );
                    return Ok((records, valid_len, true));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rec(key: &str, value: &str) -> StorageRecord {
        StorageRecord::new(key, value.as_bytes().to_vec())
    }

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.wal");
        {
            let mut wal = Wal::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&rec("catalogue:nodes", "[]")).unwrap();
            wal.append(&rec("catalogue:assignment:o1", "{}")).unwrap();
            assert_eq!(wal.entries_written(), 2);
        }
        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "catalogue:nodes");
        assert_eq!(records[1].value, b"{}");
    }

    #[test]
    fn test_wal_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(Wal::replay(&dir.path().join("nope.wal")).unwrap().is_empty());
    }

    #[test]
    fn test_wal_replay_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torn.wal");
        {
            let mut wal = Wal::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&rec("k1", "v1")).unwrap();
            wal.append(&rec("k2", "v2")).unwrap();
            wal.append(&rec("k3", "v3")).unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 4).unwrap();
        }
        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].key, "k2");
    }

    #[test]
    fn test_wal_replay_stops_at_crc_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crc.wal");
        {
            let mut wal = Wal::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&rec("k1", "v1")).unwrap();
            wal.append(&rec("k2", "v2")).unwrap();
        }
        // Flip a byte inside the second payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "k1");
    }

    #[test]
    fn test_wal_recover_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recover.wal");
        {
            let mut wal = Wal::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&rec("k1", "v1")).unwrap();
            wal.append(&rec("k2", "v2")).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB, 0xCD, 0x01]).unwrap();
        }

        let records = Wal::recover(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);

        {
            let mut wal = Wal::open(&path, FsyncPolicy::Always).unwrap();
            wal.append(&rec("k3", "v3")).unwrap();
        }
        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].key, "k3");
    }

    #[test]
    fn test_wal_rewrite_then_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rw.wal");
        let mut wal = Wal::open(&path, FsyncPolicy::None).unwrap();
        for i in 0..5 {
            wal.append(&rec("k", &format!("v{}", i))).unwrap();
        }
        let keep = vec![rec("k", "v4")];
        wal.rewrite(keep.iter()).unwrap();
        wal.append(&StorageRecord::delete("other")).unwrap();
        drop(wal);

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, b"v4");
        assert!(records[1].deleted);
    }
}
