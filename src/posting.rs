//! Disk-resident posting lists, one append-only log per cluster.
//!
//! Records are framed with a fixed header carrying a CRC32 of the
//! payload; readers stop at the first frame that fails validation, so a
//! crash mid-append costs at most the torn tail.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorError};
use crate::head::ClusterId;

const POSTING_MAGIC: u32 = 0x5456_504C; // "TVPL"
const POSTING_VERSION: u16 = 1;
const HEADER_LEN: usize = 16;
const DEFAULT_CACHE_CAP: usize = 64;

/// One stored vector inside a posting list.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PostingEntry {
    pub vid: i64,
    pub vector: Vec<f32>,
}

struct FrameHeader {
    len: u32,
    crc: u32,
}

impl FrameHeader {
    fn encode(payload: &[u8]) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&POSTING_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&POSTING_VERSION.to_le_bytes());
        // bytes 6..8 reserved for flags
        buf[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Option<FrameHeader> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let version = u16::from_le_bytes(buf[4..6].try_into().ok()?);
        if magic != POSTING_MAGIC || version != POSTING_VERSION {
            return None;
        }
        Some(FrameHeader {
            len: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            crc: u32::from_le_bytes(buf[12..16].try_into().ok()?),
        })
    }
}

struct CachedList {
    file_len: u64,
    entries: Arc<Vec<PostingEntry>>,
}

/// Store for all posting logs under one directory.
pub struct PostingStore {
    dir: PathBuf,
    cache: Mutex<LruCache<ClusterId, CachedList>>,
    // per-cluster lock: appends and compactions exclude reads of the
    // same cluster, different clusters proceed independently
    locks: Mutex<HashMap<ClusterId, Arc<RwLock<()>>>>,
}

impl PostingStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(PostingStore {
            dir,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_CACHE_CAP).unwrap(),
            )),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, cluster: ClusterId) -> PathBuf {
        self.dir.join(format!("cluster-{cluster:06}.log"))
    }

    fn lock_for(&self, cluster: ClusterId) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(cluster)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Append one entry and make it durable before returning.
    pub fn append(&self, cluster: ClusterId, entry: &PostingEntry) -> Result<()> {
        self.append_batch(cluster, std::slice::from_ref(entry))
    }

    /// Append a batch of entries with a single fsync at the end.
    pub fn append_batch(&self, cluster: ClusterId, entries: &[PostingEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let lock = self.lock_for(cluster);
        let _guard = lock.write();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(cluster))?;
        for entry in entries {
            let payload = bincode::serialize(entry)
                .map_err(|e| VectorError::corruption(format!("encode posting: {e}")))?;
            file.write_all(&FrameHeader::encode(&payload))?;
            file.write_all(&payload)?;
        }
        file.flush()?;
        file.sync_data()?;
        self.cache.lock().pop(&cluster);
        Ok(())
    }

    /// All live frames of a cluster, cached until the file grows or is
    /// rewritten. A missing file reads as an empty list.
    pub fn read(&self, cluster: ClusterId) -> Result<Arc<Vec<PostingEntry>>> {
        let lock = self.lock_for(cluster);
        let _guard = lock.read();
        let path = self.path(cluster);
        let file_len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Arc::new(Vec::new()))
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(cached) = self.cache.lock().get(&cluster) {
            if cached.file_len == file_len {
                return Ok(cached.entries.clone());
            }
        }
        let entries = Arc::new(read_log(&path, cluster)?);
        self.cache.lock().put(
            cluster,
            CachedList {
                file_len,
                entries: entries.clone(),
            },
        );
        Ok(entries)
    }

    /// Rewrite a cluster's log keeping only `entries`, atomically via a
    /// temp file and rename.
    pub fn rewrite(&self, cluster: ClusterId, entries: &[PostingEntry]) -> Result<()> {
        let lock = self.lock_for(cluster);
        let _guard = lock.write();
        let path = self.path(cluster);
        let tmp = path.with_extension("log.tmp");
        {
            let mut file = File::create(&tmp)?;
            for entry in entries {
                let payload = bincode::serialize(entry)
                    .map_err(|e| VectorError::corruption(format!("encode posting: {e}")))?;
                file.write_all(&FrameHeader::encode(&payload))?;
                file.write_all(&payload)?;
            }
            file.flush()?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        self.cache.lock().pop(&cluster);
        Ok(())
    }

    /// Drop a retired cluster's log. Missing file is not an error.
    pub fn remove(&self, cluster: ClusterId) -> Result<()> {
        let lock = self.lock_for(cluster);
        let _guard = lock.write();
        match fs::remove_file(self.path(cluster)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.lock().pop(&cluster);
        Ok(())
    }

    /// Copy a cluster's log into another directory (generation save).
    pub fn copy_into(&self, cluster: ClusterId, dest_dir: &Path) -> Result<()> {
        let lock = self.lock_for(cluster);
        let _guard = lock.read();
        let src = self.path(cluster);
        if src.exists() {
            fs::copy(&src, dest_dir.join(format!("cluster-{cluster:06}.log")))?;
        }
        Ok(())
    }
}

fn read_log(path: &Path, cluster: ClusterId) -> Result<Vec<PostingEntry>> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset = 0u64;
    loop {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let Some(frame) = FrameHeader::decode(&header) else {
            tracing::warn!(cluster, offset, "bad frame header, truncating read");
            break;
        };
        // the length field is untrusted; never allocate past what the
        // file can actually hold
        let remaining = file_len.saturating_sub(offset + HEADER_LEN as u64);
        if u64::from(frame.len) > remaining {
            tracing::warn!(cluster, offset, len = frame.len, "oversized frame, truncating read");
            break;
        }
        let mut payload = vec![0u8; frame.len as usize];
        if reader.read_exact(&mut payload).is_err() {
            tracing::warn!(cluster, offset, "torn tail record, truncating read");
            break;
        }
        if crc32fast::hash(&payload) != frame.crc {
            tracing::warn!(cluster, offset, "crc mismatch, truncating read");
            break;
        }
        let entry: PostingEntry = bincode::deserialize(&payload)
            .map_err(|e| VectorError::corruption(format!("decode posting: {e}")))?;
        entries.push(entry);
        offset += (HEADER_LEN + frame.len as usize) as u64;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn entry(vid: i64) -> PostingEntry {
        PostingEntry {
            vid,
            vector: vec![vid as f32, vid as f32 + 0.5],
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        store.append(7, &entry(1)).unwrap();
        store
            .append_batch(7, &[entry(2), entry(3)])
            .unwrap();
        let got = store.read(7).unwrap();
        assert_eq!(got.as_slice(), &[entry(1), entry(2), entry(3)]);
    }

    #[test]
    fn missing_cluster_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        assert!(store.read(42).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        store.append_batch(0, &[entry(10), entry(11)]).unwrap();
        // simulate a crash mid-append: garbage header bytes at the end
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.path(0))
            .unwrap();
        file.write_all(&[0xAB; 9]).unwrap();
        drop(file);
        let got = store.read(0).unwrap();
        assert_eq!(got.as_slice(), &[entry(10), entry(11)]);
    }

    #[test]
    fn oversized_length_field_does_not_allocate() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        store.append_batch(2, &[entry(1), entry(2)]).unwrap();
        // a valid-looking header whose length field dwarfs the file
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&POSTING_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&POSTING_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.path(2))
            .unwrap();
        file.write_all(&header).unwrap();
        drop(file);
        let got = store.read(2).unwrap();
        assert_eq!(got.as_slice(), &[entry(1), entry(2)]);
    }

    #[test]
    fn corrupt_payload_truncates_from_there() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        store.append(3, &entry(1)).unwrap();
        let first_len = fs::metadata(store.path(3)).unwrap().len();
        store.append_batch(3, &[entry(2), entry(3)]).unwrap();
        // flip a byte inside the second record's payload
        let mut bytes = fs::read(store.path(3)).unwrap();
        let idx = first_len as usize + HEADER_LEN + 2;
        bytes[idx] ^= 0xFF;
        fs::write(store.path(3), &bytes).unwrap();
        let got = store.read(3).unwrap();
        assert_eq!(got.as_slice(), &[entry(1)]);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        store
            .append_batch(5, &[entry(1), entry(2), entry(3)])
            .unwrap();
        store.rewrite(5, &[entry(2)]).unwrap();
        let got = store.read(5).unwrap();
        assert_eq!(got.as_slice(), &[entry(2)]);
        assert!(!store.path(5).with_extension("log.tmp").exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        store.append(9, &entry(1)).unwrap();
        store.remove(9).unwrap();
        store.remove(9).unwrap();
        assert!(store.read(9).unwrap().is_empty());
    }

    #[test]
    fn cache_sees_new_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = PostingStore::open(dir.path()).unwrap();
        store.append(1, &entry(1)).unwrap();
        assert_eq!(store.read(1).unwrap().len(), 1);
        store.append(1, &entry(2)).unwrap();
        assert_eq!(store.read(1).unwrap().len(), 2);
    }
}
