//! Durable tombstone set. Deletions append a fixed-size checksummed
//! record to a log before the id becomes visible in memory, so a crash
//! never loses an acknowledged delete. The set only grows between
//! compactions; compaction rewrites the log with whatever survived.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::error::Result;

const RECORD_LEN: usize = 12; // i64 vid + crc32 of the vid bytes

pub struct DeletedIdSet {
    path: PathBuf,
    ids: RwLock<HashSet<i64>>,
    writer: Mutex<File>,
}

impl DeletedIdSet {
    /// Open (or create) the log at `path` and replay it. Stops at the
    /// first torn or corrupt record.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut ids = HashSet::new();
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut record = [0u8; RECORD_LEN];
            loop {
                match reader.read_exact(&mut record) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                let vid = i64::from_le_bytes(record[0..8].try_into().unwrap());
                let crc = u32::from_le_bytes(record[8..12].try_into().unwrap());
                if crc32fast::hash(&record[0..8]) != crc {
                    tracing::warn!(?path, "torn tombstone record, truncating replay");
                    break;
                }
                ids.insert(vid);
            }
        }
        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(DeletedIdSet {
            path,
            ids: RwLock::new(ids),
            writer: Mutex::new(writer),
        })
    }

    /// Record a deletion. Durable before it returns. Returns `false`
    /// when the id was already tombstoned (idempotent no-op).
    pub fn insert(&self, vid: i64) -> Result<bool> {
        if self.ids.read().contains(&vid) {
            return Ok(false);
        }
        let mut writer = self.writer.lock();
        // re-check under the writer lock so racing deletes of the same
        // id append only once
        if self.ids.read().contains(&vid) {
            return Ok(false);
        }
        let mut record = [0u8; RECORD_LEN];
        record[0..8].copy_from_slice(&vid.to_le_bytes());
        record[8..12].copy_from_slice(&crc32fast::hash(&vid.to_le_bytes()).to_le_bytes());
        writer.write_all(&record)?;
        writer.flush()?;
        writer.sync_data()?;
        self.ids.write().insert(vid);
        Ok(true)
    }

    pub fn contains(&self, vid: i64) -> bool {
        self.ids.read().contains(&vid)
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// Sorted copy of the current ids.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.ids.read().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Drop `drop` from the set and rewrite the log atomically
    /// (post-compaction). Whatever survives is recomputed from the live
    /// set under the writer lock, so an insert racing this call either
    /// lands in the rewritten log or appends to its replacement.
    pub fn purge(&self, drop: &HashSet<i64>) -> Result<()> {
        let mut writer = self.writer.lock();
        let mut remaining: Vec<i64> = self
            .ids
            .read()
            .iter()
            .copied()
            .filter(|vid| !drop.contains(vid))
            .collect();
        remaining.sort_unstable();
        let tmp = self.path.with_extension("tomb.tmp");
        {
            let mut file = File::create(&tmp)?;
            for &vid in &remaining {
                let mut record = [0u8; RECORD_LEN];
                record[0..8].copy_from_slice(&vid.to_le_bytes());
                record[8..12]
                    .copy_from_slice(&crc32fast::hash(&vid.to_le_bytes()).to_le_bytes());
                file.write_all(&record)?;
            }
            file.flush()?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        *writer = OpenOptions::new().create(true).append(true).open(&self.path)?;
        *self.ids.write() = remaining.into_iter().collect();
        Ok(())
    }

    /// Write a standalone snapshot file (generation save).
    pub fn write_snapshot(path: &Path, ids: &[i64]) -> Result<()> {
        let mut file = File::create(path)?;
        for &vid in ids {
            let mut record = [0u8; RECORD_LEN];
            record[0..8].copy_from_slice(&vid.to_le_bytes());
            record[8..12].copy_from_slice(&crc32fast::hash(&vid.to_le_bytes()).to_le_bytes());
            file.write_all(&record)?;
        }
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deleted.log");
        {
            let set = DeletedIdSet::open(&path).unwrap();
            assert!(set.insert(5).unwrap());
            assert!(!set.insert(5).unwrap());
            assert!(set.insert(9).unwrap());
            assert_eq!(set.len(), 2);
        }
        let reopened = DeletedIdSet::open(&path).unwrap();
        assert!(reopened.contains(5));
        assert!(reopened.contains(9));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn torn_record_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deleted.log");
        {
            let set = DeletedIdSet::open(&path).unwrap();
            set.insert(1).unwrap();
            set.insert(2).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x7F; 5]).unwrap();
        drop(file);
        let reopened = DeletedIdSet::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn purge_drops_only_named_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deleted.log");
        let set = DeletedIdSet::open(&path).unwrap();
        for vid in 0..6 {
            set.insert(vid).unwrap();
        }
        set.purge(&(0..4).collect()).unwrap();
        assert_eq!(set.snapshot(), vec![4, 5]);
        // appends still work after the swap
        set.insert(7).unwrap();
        let reopened = DeletedIdSet::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), vec![4, 5, 7]);
    }

    #[test]
    fn purge_keeps_ids_inserted_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deleted.log");
        let set = DeletedIdSet::open(&path).unwrap();
        set.insert(1).unwrap();
        set.insert(2).unwrap();
        let drop: HashSet<i64> = set.snapshot().into_iter().collect();
        // a delete lands between the snapshot and the rewrite
        set.insert(3).unwrap();
        set.purge(&drop).unwrap();
        assert_eq!(set.snapshot(), vec![3]);
        let reopened = DeletedIdSet::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), vec![3]);
    }
}
