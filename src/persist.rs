//! Generation-based persistence. Every save produces a self-contained
//! directory (`gen-NNNNNN`) holding the head artifact, the manifest,
//! a tombstone snapshot, metadata, and copies of the posting logs. The
//! `CURRENT` pointer file is swapped last via rename, so a crash at any
//! point leaves the previous generation loadable.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::error::{Result, VectorError};
use crate::head::HeadIndex;

const HEAD_MAGIC: u32 = 0x5456_4844; // "TVHD"
const HEAD_VERSION: u16 = 1;
const HEAD_HEADER_LEN: usize = 16;

pub const MANIFEST_VERSION: u32 = 1;

pub const CURRENT_FILE: &str = "CURRENT";
pub const HEAD_FILE: &str = "head.bin";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const DELETED_FILE: &str = "deleted.log";
pub const METADATA_FILE: &str = "metadata.bin";
pub const POSTINGS_DIR: &str = "postings";

/// Summary record written with every generation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub created_unix: u64,
    pub config: IndexConfig,
    pub next_vid: i64,
    pub sample_count: usize,
    pub deleted_count: usize,
    pub cluster_count: usize,
}

impl Manifest {
    pub fn new(
        config: IndexConfig,
        next_vid: i64,
        sample_count: usize,
        deleted_count: usize,
        cluster_count: usize,
    ) -> Self {
        Manifest {
            format_version: MANIFEST_VERSION,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            config,
            next_vid,
            sample_count,
            deleted_count,
            cluster_count,
        }
    }
}

/// Pathing for an index root directory.
#[derive(Clone, Debug)]
pub struct GenerationLayout {
    root: PathBuf,
}

impl GenerationLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        GenerationLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generation_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn postings_dir(&self, name: &str) -> PathBuf {
        self.generation_dir(name).join(POSTINGS_DIR)
    }

    /// Name of the generation `CURRENT` points at, if any.
    pub fn read_current(&self) -> Result<Option<String>> {
        let path = self.root.join(CURRENT_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let name = text.trim().to_string();
                if name.is_empty() {
                    return Err(VectorError::corruption("empty CURRENT pointer"));
                }
                Ok(Some(name))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point `CURRENT` at `name`. Write-then-rename so readers never
    /// observe a partial pointer.
    pub fn publish(&self, name: &str) -> Result<()> {
        let path = self.root.join(CURRENT_FILE);
        let tmp = self.root.join("CURRENT.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(name.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &path)?;
        tracing::info!(generation = name, "generation published");
        Ok(())
    }

    /// Next unused `gen-NNNNNN` name under the root.
    pub fn next_generation_name(&self) -> Result<String> {
        fs::create_dir_all(&self.root)?;
        let mut max = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(num) = name.strip_prefix("gen-") {
                if let Ok(num) = num.parse::<u64>() {
                    max = max.max(num);
                }
            }
        }
        Ok(format!("gen-{:06}", max + 1))
    }
}

pub fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    let tmp = dir.join("manifest.json.tmp");
    {
        let mut file = File::create(&tmp)?;
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| VectorError::corruption(format!("encode manifest: {e}")))?;
        file.write_all(&json)?;
        file.flush()?;
        file.sync_data()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn read_manifest(dir: &Path) -> Result<Manifest> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    let manifest: Manifest = serde_json::from_slice(&bytes)
        .map_err(|e| VectorError::corruption(format!("decode manifest: {e}")))?;
    if manifest.format_version != MANIFEST_VERSION {
        return Err(VectorError::corruption(format!(
            "unsupported manifest version {}",
            manifest.format_version
        )));
    }
    Ok(manifest)
}

/// Serialize the head index behind a checksummed header. Unlike posting
/// logs, any validation failure here is fatal on load.
pub fn write_head(dir: &Path, head: &HeadIndex) -> Result<()> {
    let payload = bincode::serialize(head)
        .map_err(|e| VectorError::corruption(format!("encode head: {e}")))?;
    let mut header = [0u8; HEAD_HEADER_LEN];
    header[0..4].copy_from_slice(&HEAD_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&HEAD_VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    header[12..16].copy_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    let path = dir.join(HEAD_FILE);
    let tmp = dir.join("head.bin.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&header)?;
        file.write_all(&payload)?;
        file.flush()?;
        file.sync_data()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

pub fn read_head(dir: &Path) -> Result<HeadIndex> {
    let mut file = File::open(dir.join(HEAD_FILE))?;
    let mut header = [0u8; HEAD_HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| VectorError::corruption("head artifact truncated header"))?;
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
    if magic != HEAD_MAGIC {
        return Err(VectorError::corruption("head artifact bad magic"));
    }
    if version != HEAD_VERSION {
        return Err(VectorError::corruption(format!(
            "head artifact unsupported version {version}"
        )));
    }
    let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(header[12..16].try_into().unwrap());
    // the length field is untrusted; bound it by the file before
    // allocating
    let file_len = file.metadata()?.len();
    if len as u64 > file_len.saturating_sub(HEAD_HEADER_LEN as u64) {
        return Err(VectorError::corruption("head artifact oversized length"));
    }
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)
        .map_err(|_| VectorError::corruption("head artifact truncated payload"))?;
    if crc32fast::hash(&payload) != crc {
        return Err(VectorError::corruption("head artifact checksum mismatch"));
    }
    bincode::deserialize(&payload)
        .map_err(|e| VectorError::corruption(format!("decode head: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::Metric;
    use crate::head::ClusterParams;

    fn sample_head() -> HeadIndex {
        let vectors: Vec<Vec<f32>> = (0..50)
            .map(|i| vec![i as f32, (i * 2) as f32])
            .collect();
        let params = ClusterParams {
            target_clusters: 8,
            max_leaf: 8,
            kmeans_iters: 5,
            seed: 7,
        };
        HeadIndex::build(&vectors, 2, Metric::L2, params).unwrap().0
    }

    #[test]
    fn head_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let head = sample_head();
        write_head(dir.path(), &head).unwrap();
        let loaded = read_head(dir.path()).unwrap();
        assert_eq!(loaded.cluster_count(), head.cluster_count());
        assert_eq!(loaded.dim(), 2);
    }

    #[test]
    fn corrupt_head_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_head(dir.path(), &sample_head()).unwrap();
        let path = dir.path().join(HEAD_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_head(dir.path()),
            Err(VectorError::Corruption(_))
        ));
    }

    #[test]
    fn oversized_head_length_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_head(dir.path(), &sample_head()).unwrap();
        let path = dir.path().join(HEAD_FILE);
        let mut bytes = fs::read(&path).unwrap();
        // length field claims far more payload than the file holds
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_head(dir.path()),
            Err(VectorError::Corruption(_))
        ));
    }

    #[test]
    fn current_pointer_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let layout = GenerationLayout::new(dir.path());
        assert!(layout.read_current().unwrap().is_none());
        assert_eq!(layout.next_generation_name().unwrap(), "gen-000001");
        fs::create_dir_all(layout.generation_dir("gen-000001")).unwrap();
        layout.publish("gen-000001").unwrap();
        assert_eq!(
            layout.read_current().unwrap().as_deref(),
            Some("gen-000001")
        );
        assert_eq!(layout.next_generation_name().unwrap(), "gen-000002");
    }

    #[test]
    fn manifest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::new(IndexConfig::default(), 42, 40, 2, 7);
        write_manifest(dir.path(), &manifest).unwrap();
        let loaded = read_manifest(dir.path()).unwrap();
        assert_eq!(loaded.next_vid, 42);
        assert_eq!(loaded.sample_count, 40);
        assert_eq!(loaded.deleted_count, 2);
        assert_eq!(loaded.cluster_count, 7);
    }
}
