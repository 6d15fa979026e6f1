//! Optional per-vector metadata, opaque bytes keyed by vid.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{Result, VectorError};

pub trait MetadataStore: Send + Sync {
    fn get(&self, vid: i64) -> Option<Vec<u8>>;
    fn put(&self, vid: i64, value: Vec<u8>);
    fn delete(&self, vid: i64);
    fn len(&self) -> usize;
}

/// In-memory map persisted as one bincode blob per generation.
pub struct FileMetadataStore {
    path: PathBuf,
    map: RwLock<HashMap<i64, Vec<u8>>>,
}

impl FileMetadataStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            bincode::deserialize_from(reader)
                .map_err(|e| VectorError::corruption(format!("decode metadata: {e}")))?
        } else {
            HashMap::new()
        };
        Ok(FileMetadataStore {
            path,
            map: RwLock::new(map),
        })
    }

    /// Persist the current map, atomically via temp file and rename.
    pub fn save(&self) -> Result<()> {
        self.save_to(&self.path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("meta.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let map = self.map.read();
            bincode::serialize_into(&mut writer, &*map)
                .map_err(|e| VectorError::corruption(format!("encode metadata: {e}")))?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
    fn get(&self, vid: i64) -> Option<Vec<u8>> {
        self.map.read().get(&vid).cloned()
    }

    fn put(&self, vid: i64, value: Vec<u8>) {
        self.map.write().insert(vid, value);
    }

    fn delete(&self, vid: i64) {
        self.map.write().remove(&vid);
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}
