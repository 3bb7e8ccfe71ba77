use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};
use crate::preprocessing::TOKEN_BYTES;

#[derive(Debug)]
enum BlockSource {
    Memory(Arc<Vec<u32>>),
    File(Mutex<File>),
}

/// Fixed-length token blocks for causal language modelling. Labels are the
/// inputs themselves; the shift happens in the loss.
#[derive(Debug)]
pub struct LmDataset {
    seq_len: usize,
    num_blocks: usize,
    source: BlockSource,
}

impl LmDataset {
    pub fn from_tokens(tokens: Vec<u32>, seq_len: usize) -> Result<Self> {
        if seq_len == 0 {
            return Err(Error::Dataset("seq_len must be greater than zero".into()));
        }
        if tokens.len() % seq_len != 0 {
            return Err(Error::Dataset(format!(
                "{} tokens do not divide into blocks of {seq_len}",
                tokens.len()
            )));
        }
        Ok(Self {
            seq_len,
            num_blocks: tokens.len() / seq_len,
            source: BlockSource::Memory(Arc::new(tokens)),
        })
    }

    /// Opens a block file written by [`crate::preprocessing::BlockWriter`].
    pub fn open(path: &Path, seq_len: usize) -> Result<Self> {
        if seq_len == 0 {
            return Err(Error::Dataset("seq_len must be greater than zero".into()));
        }
        let file = File::open(path)?;
        let bytes = file.metadata()?.len() as usize;
        let block_bytes = seq_len * TOKEN_BYTES;
        if bytes % block_bytes != 0 {
            return Err(Error::Dataset(format!(
                "{} holds {bytes} bytes, not a multiple of the {block_bytes} byte block size",
                path.display()
            )));
        }
        Ok(Self {
            seq_len,
            num_blocks: bytes / block_bytes,
            source: BlockSource::File(Mutex::new(file)),
        })
    }

    pub fn len(&self) -> usize {
        self.num_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn block(&self, index: usize) -> Result<Vec<u32>> {
        if index >= self.num_blocks {
            return Err(Error::Dataset(format!(
                "block {index} out of range for dataset of {} blocks",
                self.num_blocks
            )));
        }
        match &self.source {
            BlockSource::Memory(tokens) => {
                let start = index * self.seq_len;
                Ok(tokens[start..start + self.seq_len].to_vec())
            }
            BlockSource::File(file) => {
                let mut bytes = vec![0u8; self.seq_len * TOKEN_BYTES];
                {
                    let mut file = file
                        .lock()
                        .map_err(|_| Error::Dataset("block file lock poisoned".into()))?;
                    file.seek(SeekFrom::Start((index * bytes.len()) as u64))?;
                    file.read_exact(&mut bytes)?;
                }
                Ok(bytes
                    .chunks_exact(TOKEN_BYTES)
                    .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect())
            }
        }
    }
}
