use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::preprocessing::TOKEN_BYTES;

pub const CACHE_FORMAT_VERSION: u32 = 1;
pub const TRAIN_FILE: &str = "train.bin";
pub const VALIDATION_FILE: &str = "validation.bin";
pub const METADATA_FILE: &str = "metadata.json";
const SOURCE_TAG_LEN: usize = 12;

/// Identity of a preprocessed dataset. A cache entry is reused only when all
/// of these match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    pub dataset_id: String,
    pub name: String,
    pub seq_len: usize,
    pub validation_ratio: f64,
    pub tokenizer_sha256: String,
    /// SHA-256 over the description of where the raw text came from.
    pub source_sha256: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub documents: usize,
    pub blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub format_version: u32,
    #[serde(flatten)]
    pub key: CacheKey,
    pub train: SplitSummary,
    pub validation: SplitSummary,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct PreprocessedCache {
    dir: PathBuf,
}

impl PreprocessedCache {
    pub fn new(preprocessed_dir: &Path, key: &CacheKey) -> Self {
        let source = key.source_sha256.get(..SOURCE_TAG_LEN).unwrap_or(&key.source_sha256);
        let leaf = format!(
            "{}-seq={}-val={}-src={}",
            key.name, key.seq_len, key.validation_ratio, source
        );
        Self {
            dir: preprocessed_dir.join(&key.dataset_id).join(leaf),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn train_path(&self) -> PathBuf {
        self.dir.join(TRAIN_FILE)
    }

    pub fn validation_path(&self) -> PathBuf {
        self.dir.join(VALIDATION_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Returns the stored metadata when it matches `key` and the block files
    /// have the sizes it records.
    pub fn load_if_valid(&self, key: &CacheKey) -> Option<CacheMetadata> {
        let bytes = fs::read(self.metadata_path()).ok()?;
        let metadata: CacheMetadata = match serde_json::from_slice(&bytes) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(path = %self.metadata_path().display(), error = %err, "ignoring unreadable dataset cache");
                return None;
            }
        };
        if metadata.format_version != CACHE_FORMAT_VERSION || &metadata.key != key {
            tracing::info!(dir = %self.dir.display(), "dataset cache is stale, rebuilding");
            return None;
        }
        let block_bytes = (key.seq_len * TOKEN_BYTES) as u64;
        let expect = [
            (self.train_path(), metadata.train.blocks),
            (self.validation_path(), metadata.validation.blocks),
        ];
        for (path, blocks) in expect {
            let actual = fs::metadata(&path).map(|meta| meta.len()).ok()?;
            if actual != blocks as u64 * block_bytes {
                tracing::warn!(path = %path.display(), "dataset cache file has unexpected size, rebuilding");
                return None;
            }
        }
        Some(metadata)
    }

    /// Opens a temporary writer for one of the block files.
    pub fn create_staging(&self, file: &str) -> Result<(PathBuf, BufWriter<fs::File>)> {
        fs::create_dir_all(&self.dir)?;
        let staging = self.dir.join(format!("{file}.tmp"));
        let writer = BufWriter::new(fs::File::create(&staging)?);
        Ok((staging, writer))
    }

    /// Moves staged block files in place, then writes the metadata last.
    pub fn commit(&self, staged: &[(PathBuf, &str)], metadata: &CacheMetadata) -> Result<()> {
        let _ = fs::remove_file(self.metadata_path());
        for (staging, file) in staged {
            fs::rename(staging, self.dir.join(file))?;
        }
        let tmp = self.dir.join(format!("{METADATA_FILE}.tmp"));
        let mut out = fs::File::create(&tmp)?;
        out.write_all(&serde_json::to_vec_pretty(metadata)?)?;
        out.write_all(b"\n")?;
        out.sync_all()?;
        fs::rename(tmp, self.metadata_path())?;
        Ok(())
    }
}
