//! Corpus download, tokenization and block caching for causal language
//! model training.

pub mod auto;
pub mod cache;
pub mod corpora;
pub mod dataset;
pub mod errors;
pub mod hub;
pub mod preprocessing;
pub mod registry;

pub use auto::{get_auto_dataset, DatasetRequest, LmDatasets, LocalFiles};
pub use corpora::{ParquetCorpus, StreamingCorpus, TextCorpus};
pub use dataset::LmDataset;
pub use errors::{Error, Result};
pub use registry::{lookup, DatasetSpec, DATASETS};
