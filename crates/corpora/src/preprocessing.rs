use std::io::Write;

use tokenizers::Tokenizer;

use crate::errors::{Error, Result};

/// Documents tokenized and grouped together before the tail is dropped.
pub const GROUP_BATCH_SIZE: usize = 1000;

pub const TOKEN_BYTES: usize = std::mem::size_of::<u32>();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub documents: usize,
    pub blocks: usize,
    pub dropped_tokens: usize,
}

/// Writes fixed-length blocks of token ids as little endian `u32`.
pub struct BlockWriter<W: Write> {
    out: W,
    seq_len: usize,
    stats: GroupStats,
    scratch: Vec<u8>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(out: W, seq_len: usize) -> Result<Self> {
        if seq_len == 0 {
            return Err(Error::Dataset("seq_len must be greater than zero".into()));
        }
        Ok(Self {
            out,
            seq_len,
            stats: GroupStats::default(),
            scratch: Vec::with_capacity(seq_len * TOKEN_BYTES),
        })
    }

    /// Cuts `tokens` into blocks, dropping whatever does not fill a final block.
    pub fn write_group(&mut self, tokens: &[u32]) -> Result<usize> {
        let mut written = 0;
        for block in tokens.chunks_exact(self.seq_len) {
            self.scratch.clear();
            for token in block {
                self.scratch.extend_from_slice(&token.to_le_bytes());
            }
            self.out.write_all(&self.scratch)?;
            written += 1;
        }
        self.stats.blocks += written;
        self.stats.dropped_tokens += tokens.len() % self.seq_len;
        Ok(written)
    }

    pub fn stats(&self) -> GroupStats {
        self.stats
    }

    pub fn finish(mut self) -> Result<(W, GroupStats)> {
        self.out.flush()?;
        Ok((self.out, self.stats))
    }
}

pub fn tokenize_batch(tokenizer: &Tokenizer, documents: Vec<String>) -> Result<Vec<u32>> {
    let encodings = tokenizer.encode_batch(documents, true)?;
    let total = encodings.iter().map(|encoding| encoding.len()).sum();
    let mut ids = Vec::with_capacity(total);
    for encoding in &encodings {
        ids.extend_from_slice(encoding.get_ids());
    }
    Ok(ids)
}

/// Tokenizes `documents` in groups of [`GROUP_BATCH_SIZE`] and writes each
/// group's concatenation as whole blocks.
pub fn group_texts<I, W>(
    tokenizer: &Tokenizer,
    documents: I,
    writer: &mut BlockWriter<W>,
) -> Result<GroupStats>
where
    I: IntoIterator<Item = Result<String>>,
    W: Write,
{
    let start = writer.stats();
    let mut batch = Vec::with_capacity(GROUP_BATCH_SIZE);
    let mut documents_seen = 0;
    for document in documents {
        batch.push(document?);
        documents_seen += 1;
        if batch.len() == GROUP_BATCH_SIZE {
            let ids = tokenize_batch(tokenizer, std::mem::take(&mut batch))?;
            writer.write_group(&ids)?;
            if documents_seen % (GROUP_BATCH_SIZE * 100) == 0 {
                tracing::debug!(documents = documents_seen, "grouped documents");
            }
        }
    }
    if !batch.is_empty() {
        let ids = tokenize_batch(tokenizer, batch)?;
        writer.write_group(&ids)?;
    }

    let end = writer.stats();
    Ok(GroupStats {
        documents: documents_seen,
        blocks: end.blocks - start.blocks,
        dropped_tokens: end.dropped_tokens - start.dropped_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_tail_of_each_group() {
        let mut writer = BlockWriter::new(Vec::new(), 4).unwrap();
        assert_eq!(writer.write_group(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap(), 2);
        assert_eq!(writer.write_group(&[10, 11, 12]).unwrap(), 0);
        let (bytes, stats) = writer.finish().unwrap();

        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.dropped_tokens, 4);
        let tokens: Vec<u32> = bytes
            .chunks_exact(TOKEN_BYTES)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(tokens, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn zero_sequence_length_is_rejected() {
        assert!(BlockWriter::new(Vec::new(), 0).is_err());
    }
}
