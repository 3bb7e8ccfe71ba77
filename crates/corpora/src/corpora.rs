use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use arrow_array::{Array, LargeStringArray, RecordBatch, StringArray};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::errors::ParquetError;

use crate::errors::{Error, Result};

pub type DocumentStream<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

/// A source of raw documents, streamed in a stable order.
pub trait TextCorpus {
    fn stream(&self) -> Result<DocumentStream<'_>>;

    /// Number of documents `stream` yields, computed without tokenizing.
    fn num_documents(&self) -> Result<usize>;
}

/// Plain text shards with one document per non-empty line.
#[derive(Clone, Debug)]
pub struct StreamingCorpus {
    shards: Vec<PathBuf>,
}

impl StreamingCorpus {
    pub fn new(shards: Vec<PathBuf>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::Dataset(
                "expected at least one shard for corpus".into(),
            ));
        }
        if let Some(missing) = shards.iter().find(|path| !path.is_file()) {
            return Err(Error::Dataset(format!(
                "corpus shard not found at {}",
                missing.display()
            )));
        }
        Ok(Self { shards })
    }

    pub fn shard_paths(&self) -> &[PathBuf] {
        &self.shards
    }
}

impl TextCorpus for StreamingCorpus {
    fn stream(&self) -> Result<DocumentStream<'_>> {
        Ok(Box::new(CorpusStream {
            shards: &self.shards,
            next_shard: 0,
            current_reader: None,
        }))
    }

    fn num_documents(&self) -> Result<usize> {
        let mut count = 0;
        for document in self.stream()? {
            document?;
            count += 1;
        }
        Ok(count)
    }
}

struct CorpusStream<'a> {
    shards: &'a [PathBuf],
    next_shard: usize,
    current_reader: Option<Lines<BufReader<File>>>,
}

impl CorpusStream<'_> {
    fn advance_shard(&mut self) -> Result<bool> {
        let Some(shard_path) = self.shards.get(self.next_shard) else {
            return Ok(false);
        };
        tracing::debug!(
            shard = self.next_shard + 1,
            total = self.shards.len(),
            path = %shard_path.display(),
            "streaming text shard"
        );
        let file = File::open(shard_path)?;
        self.current_reader = Some(BufReader::new(file).lines());
        self.next_shard += 1;
        Ok(true)
    }
}

impl Iterator for CorpusStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = self.current_reader.as_mut() {
                match reader.next() {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        return Some(Ok(line));
                    }
                    Some(Err(err)) => return Some(Err(err.into())),
                    None => {
                        self.current_reader = None;
                        continue;
                    }
                }
            }

            match self.advance_shard() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Parquet shards holding one document per row in a string column.
#[derive(Clone, Debug)]
pub struct ParquetCorpus {
    shards: Vec<PathBuf>,
    column: String,
}

impl ParquetCorpus {
    pub const TEXT_COLUMN: &'static str = "text";

    pub fn new(shards: Vec<PathBuf>) -> Result<Self> {
        Self::with_column(shards, Self::TEXT_COLUMN)
    }

    pub fn with_column(shards: Vec<PathBuf>, column: impl Into<String>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::Dataset(
                "expected at least one parquet shard for corpus".into(),
            ));
        }
        Ok(Self {
            shards,
            column: column.into(),
        })
    }

    pub fn shard_paths(&self) -> &[PathBuf] {
        &self.shards
    }
}

impl TextCorpus for ParquetCorpus {
    fn stream(&self) -> Result<DocumentStream<'_>> {
        Ok(Box::new(ParquetStream {
            corpus: self,
            next_shard: 0,
            reader: None,
            pending: VecDeque::new(),
        }))
    }

    fn num_documents(&self) -> Result<usize> {
        let mut rows = 0usize;
        for shard in &self.shards {
            let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(shard)?)?;
            rows += builder.metadata().file_metadata().num_rows() as usize;
        }
        Ok(rows)
    }
}

struct ParquetStream<'a> {
    corpus: &'a ParquetCorpus,
    next_shard: usize,
    reader: Option<ParquetRecordBatchReader>,
    pending: VecDeque<String>,
}

impl ParquetStream<'_> {
    fn advance_shard(&mut self) -> Result<bool> {
        let Some(shard_path) = self.corpus.shards.get(self.next_shard) else {
            return Ok(false);
        };
        tracing::debug!(
            shard = self.next_shard + 1,
            total = self.corpus.shards.len(),
            path = %shard_path.display(),
            "streaming parquet shard"
        );
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(shard_path)?)?.build()?;
        self.reader = Some(reader);
        self.next_shard += 1;
        Ok(true)
    }

    fn enqueue(&mut self, batch: &RecordBatch) -> Result<()> {
        let column = batch.column_by_name(&self.corpus.column).ok_or_else(|| {
            Error::Dataset(format!(
                "parquet shard has no '{}' column",
                self.corpus.column
            ))
        })?;
        if let Some(values) = column.as_any().downcast_ref::<StringArray>() {
            for row in 0..values.len() {
                if values.is_valid(row) {
                    self.pending.push_back(values.value(row).to_string());
                }
            }
        } else if let Some(values) = column.as_any().downcast_ref::<LargeStringArray>() {
            for row in 0..values.len() {
                if values.is_valid(row) {
                    self.pending.push_back(values.value(row).to_string());
                }
            }
        } else {
            return Err(Error::Dataset(format!(
                "parquet column '{}' is not a string column",
                self.corpus.column
            )));
        }
        Ok(())
    }
}

impl Iterator for ParquetStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(document) = self.pending.pop_front() {
                return Some(Ok(document));
            }

            if let Some(reader) = self.reader.as_mut() {
                match reader.next() {
                    Some(Ok(batch)) => {
                        if let Err(err) = self.enqueue(&batch) {
                            return Some(Err(err));
                        }
                        continue;
                    }
                    Some(Err(err)) => return Some(Err(ParquetError::from(err).into())),
                    None => {
                        self.reader = None;
                        continue;
                    }
                }
            }

            match self.advance_shard() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn streams_non_empty_lines_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "first\n\n  \nsecond\n").unwrap();
        fs::write(&b, "third\n").unwrap();

        let corpus = StreamingCorpus::new(vec![a, b]).unwrap();
        let docs: Vec<String> = corpus.stream().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(docs, vec!["first", "second", "third"]);
        assert_eq!(corpus.num_documents().unwrap(), 3);
    }

    #[test]
    fn missing_shard_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = StreamingCorpus::new(vec![dir.path().join("absent.txt")]).unwrap_err();
        assert!(err.to_string().contains("absent.txt"));
    }
}
