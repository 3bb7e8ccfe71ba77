use std::fs;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tokenizers::Tokenizer;

use crate::cache::{
    CacheKey, CacheMetadata, PreprocessedCache, SplitSummary, CACHE_FORMAT_VERSION, TRAIN_FILE,
    VALIDATION_FILE,
};
use crate::corpora::{ParquetCorpus, StreamingCorpus, TextCorpus};
use crate::dataset::LmDataset;
use crate::errors::{Error, Result};
use crate::hub;
use crate::preprocessing::{group_texts, BlockWriter};
use crate::registry::{self, DatasetSpec};

/// Local text shards used instead of the hub download.
#[derive(Debug, Clone, Default)]
pub struct LocalFiles {
    pub train: Vec<PathBuf>,
    pub validation: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub dataset_id: String,
    pub name: Option<String>,
    pub validation_ratio: f64,
    pub seq_len: usize,
    pub num_proc: usize,
    pub files: Option<LocalFiles>,
    /// Download cache for raw shards.
    pub dataset_dir: PathBuf,
    /// Root of the tokenized block cache.
    pub preprocessed_dir: PathBuf,
}

#[derive(Debug)]
pub struct LmDatasets {
    pub train: LmDataset,
    pub validation: LmDataset,
    pub metadata: CacheMetadata,
    pub cache_dir: PathBuf,
}

/// Number of leading training documents held out when no validation split exists.
pub fn carve_size(documents: usize, ratio: f64) -> usize {
    if documents < 2 {
        return 0;
    }
    let wanted = (ratio * documents as f64).ceil() as usize;
    wanted.min(documents - 1)
}

/// Cache name used for local corpora whose id is not registered.
pub const LOCAL_NAME: &str = "local";

/// Where the raw documents of a request come from.
#[derive(Debug, Clone, Copy)]
enum Source<'a> {
    Local(&'a LocalFiles),
    Hub(&'static DatasetSpec),
}

/// Resolves a tokenized train/validation pair, reusing the preprocessed cache
/// when its key matches.
///
/// Local files may be registered under any dataset id; hub downloads need a
/// registered one.
pub fn get_auto_dataset(
    tokenizer: &Tokenizer,
    tokenizer_sha256: &str,
    request: &DatasetRequest,
) -> Result<LmDatasets> {
    let source = match &request.files {
        Some(files) => Source::Local(files),
        None => Source::Hub(registry::lookup(&request.dataset_id)?),
    };
    let name = match source {
        Source::Hub(spec) => spec.resolve_name(request.name.as_deref())?.to_string(),
        Source::Local(_) => match registry::lookup(&request.dataset_id) {
            Ok(spec) => spec.resolve_name(request.name.as_deref())?.to_string(),
            Err(_) => request.name.clone().unwrap_or_else(|| LOCAL_NAME.to_string()),
        },
    };
    let source_sha256 = match source {
        Source::Local(files) => local_fingerprint(files)?,
        Source::Hub(spec) => hub_fingerprint(spec, &name),
    };
    let dataset_id = request.dataset_id.as_str();
    let key = CacheKey {
        dataset_id: dataset_id.to_string(),
        name: name.clone(),
        seq_len: request.seq_len,
        validation_ratio: request.validation_ratio,
        tokenizer_sha256: tokenizer_sha256.to_string(),
        source_sha256,
    };
    let cache = PreprocessedCache::new(&request.preprocessed_dir, &key);

    let metadata = match cache.load_if_valid(&key) {
        Some(metadata) => {
            tracing::info!(
                dataset = dataset_id,
                name = %name,
                dir = %cache.dir().display(),
                "reusing preprocessed dataset"
            );
            metadata
        }
        None => {
            tokenizers::utils::parallelism::set_parallelism(request.num_proc > 1);
            let (train, validation): (Box<dyn TextCorpus>, Option<Box<dyn TextCorpus>>) =
                match source {
                    Source::Local(files) => {
                        tracing::info!(dataset = dataset_id, shards = files.train.len(), "reading local text files");
                        let validation = match &files.validation {
                            Some(paths) => Some(Box::new(StreamingCorpus::new(paths.clone())?)
                                as Box<dyn TextCorpus>),
                            None => None,
                        };
                        (Box::new(StreamingCorpus::new(files.train.clone())?), validation)
                    }
                    Source::Hub(spec) => {
                        tracing::info!(dataset = spec.id, repo = spec.hub_repo, name = %name, "fetching dataset shards");
                        let train =
                            hub::fetch_required_split(spec, &name, "train", &request.dataset_dir)?;
                        let validation = if spec.has_validation {
                            hub::fetch_split(spec, &name, "validation", &request.dataset_dir)?
                        } else {
                            None
                        };
                        let validation = match validation {
                            Some(paths) => {
                                Some(Box::new(ParquetCorpus::new(paths)?) as Box<dyn TextCorpus>)
                            }
                            None => None,
                        };
                        (Box::new(ParquetCorpus::new(train)?), validation)
                    }
                };
            build_cache(tokenizer, &cache, key, train.as_ref(), validation.as_deref(), request)?
        }
    };

    let train = LmDataset::open(&cache.train_path(), request.seq_len)?;
    let validation = LmDataset::open(&cache.validation_path(), request.seq_len)?;
    if train.is_empty() {
        return Err(Error::Dataset(format!(
            "training split of '{}' yields no blocks of {} tokens",
            dataset_id, request.seq_len
        )));
    }
    tracing::info!(
        train_blocks = train.len(),
        validation_blocks = validation.len(),
        seq_len = request.seq_len,
        "dataset ready"
    );
    Ok(LmDatasets {
        train,
        validation,
        metadata,
        cache_dir: cache.dir().to_path_buf(),
    })
}

/// Digest of every local shard's canonical path, size and modification time.
fn local_fingerprint(files: &LocalFiles) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(b"local\n");
    let splits = [("train", Some(&files.train)), ("validation", files.validation.as_ref())];
    for (split, paths) in splits {
        let Some(paths) = paths else {
            hasher.update(format!("{split}\tnone\n"));
            continue;
        };
        for path in paths {
            let canonical = fs::canonicalize(path).map_err(|err| {
                Error::Dataset(format!("corpus shard not found at {}: {err}", path.display()))
            })?;
            let meta = fs::metadata(&canonical)?;
            let modified = meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_nanos())
                .unwrap_or_default();
            hasher.update(format!(
                "{split}\t{}\t{}\t{modified}\n",
                canonical.display(),
                meta.len()
            ));
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of the hub repository, revision and configuration a download reads.
fn hub_fingerprint(spec: &DatasetSpec, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "hub\n{}\t{}\t{}\n",
        spec.hub_repo,
        spec.revision.unwrap_or("main"),
        name
    ));
    hex::encode(hasher.finalize())
}

fn build_cache(
    tokenizer: &Tokenizer,
    cache: &PreprocessedCache,
    key: CacheKey,
    train: &dyn TextCorpus,
    validation: Option<&dyn TextCorpus>,
    request: &DatasetRequest,
) -> Result<CacheMetadata> {
    let (train_staging, train_out) = cache.create_staging(TRAIN_FILE)?;
    let (validation_staging, validation_out) = cache.create_staging(VALIDATION_FILE)?;
    let mut train_writer = BlockWriter::new(train_out, request.seq_len)?;
    let mut validation_writer = BlockWriter::new(validation_out, request.seq_len)?;

    let (train_stats, validation_stats) = match validation {
        Some(validation) => {
            let validation_stats =
                group_texts(tokenizer, validation.stream()?, &mut validation_writer)?;
            let train_stats = group_texts(tokenizer, train.stream()?, &mut train_writer)?;
            (train_stats, validation_stats)
        }
        None => {
            let documents = train.num_documents()?;
            let held_out = carve_size(documents, request.validation_ratio);
            tracing::info!(
                documents,
                held_out,
                ratio = request.validation_ratio,
                "carving validation documents from train"
            );
            let mut stream = train.stream()?;
            let validation_stats =
                group_texts(tokenizer, stream.by_ref().take(held_out), &mut validation_writer)?;
            let train_stats = group_texts(tokenizer, stream, &mut train_writer)?;
            (train_stats, validation_stats)
        }
    };
    train_writer.finish()?;
    validation_writer.finish()?;

    let metadata = CacheMetadata {
        format_version: CACHE_FORMAT_VERSION,
        key,
        train: SplitSummary {
            documents: train_stats.documents,
            blocks: train_stats.blocks,
        },
        validation: SplitSummary {
            documents: validation_stats.documents,
            blocks: validation_stats.blocks,
        },
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    cache.commit(
        &[(train_staging, TRAIN_FILE), (validation_staging, VALIDATION_FILE)],
        &metadata,
    )?;
    tracing::info!(
        dir = %cache.dir().display(),
        train_blocks = train_stats.blocks,
        validation_blocks = validation_stats.blocks,
        dropped_tokens = train_stats.dropped_tokens + validation_stats.dropped_tokens,
        "wrote preprocessed dataset"
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carve_rounds_up_and_keeps_train_non_empty() {
        assert_eq!(carve_size(10_000, 0.0005), 5);
        assert_eq!(carve_size(10, 0.0005), 1);
        assert_eq!(carve_size(3, 0.9), 2);
        assert_eq!(carve_size(1, 0.5), 0);
        assert_eq!(carve_size(10, 0.0), 0);
    }

    #[test]
    fn local_fingerprint_tracks_shard_contents_and_split_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let shard = tmp.path().join("train.txt");
        fs::write(&shard, "a b c d").unwrap();
        let files = LocalFiles {
            train: vec![shard.clone()],
            validation: None,
        };
        let first = local_fingerprint(&files).unwrap();
        assert_eq!(first, local_fingerprint(&files).unwrap());

        fs::write(&shard, "a b c d e f g h").unwrap();
        let resized = local_fingerprint(&files).unwrap();
        assert_ne!(first, resized);

        let with_validation = LocalFiles {
            train: vec![shard.clone()],
            validation: Some(vec![shard]),
        };
        assert_ne!(resized, local_fingerprint(&with_validation).unwrap());
    }

    #[test]
    fn hub_and_local_sources_never_share_a_fingerprint() {
        let spec = registry::lookup("wikitext").unwrap();
        let hub = hub_fingerprint(spec, "wikitext-103-raw-v1");
        assert_ne!(hub, hub_fingerprint(spec, "wikitext-2-raw-v1"));
        assert_ne!(hub, local_fingerprint(&LocalFiles::default()).unwrap());
    }
}
