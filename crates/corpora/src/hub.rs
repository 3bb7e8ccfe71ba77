use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Cache, Repo, RepoType};

use crate::errors::{Error, Result};
use crate::registry::DatasetSpec;

fn dataset_repo(spec: &DatasetSpec) -> Repo {
    match spec.revision {
        Some(revision) => Repo::with_revision(
            spec.hub_repo.to_string(),
            RepoType::Dataset,
            revision.to_string(),
        ),
        None => Repo::new(spec.hub_repo.to_string(), RepoType::Dataset),
    }
}

/// Lists and downloads the parquet shards of one split into `cache_dir`.
///
/// Returns `Ok(None)` when the repository publishes no shard for the split.
pub fn fetch_split(
    spec: &DatasetSpec,
    name: &str,
    split: &str,
    cache_dir: &Path,
) -> Result<Option<Vec<PathBuf>>> {
    let prefix = spec.layout.prefix(name, split);
    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_progress(false)
        .build()?;
    let repo = api.repo(dataset_repo(spec));

    let info = repo.info()?;
    let mut shards: Vec<String> = info
        .siblings
        .into_iter()
        .map(|sibling| sibling.rfilename)
        .filter(|file| file.starts_with(&prefix) && file.ends_with(".parquet"))
        .collect();
    if shards.is_empty() {
        return Ok(None);
    }
    shards.sort();

    let cache = Cache::new(cache_dir.to_path_buf()).repo(dataset_repo(spec));
    let mut paths = Vec::with_capacity(shards.len());
    for (idx, shard) in shards.iter().enumerate() {
        if let Some(path) = cache.get(shard) {
            paths.push(path);
            continue;
        }
        tracing::info!(
            dataset = spec.id,
            shard = %shard,
            "downloading shard {}/{}",
            idx + 1,
            shards.len()
        );
        paths.push(repo.get(shard)?);
    }
    Ok(Some(paths))
}

/// Like [`fetch_split`] but fails when the split is absent.
pub fn fetch_required_split(
    spec: &DatasetSpec,
    name: &str,
    split: &str,
    cache_dir: &Path,
) -> Result<Vec<PathBuf>> {
    fetch_split(spec, name, split, cache_dir)?.ok_or_else(|| {
        Error::Dataset(format!(
            "no '{split}' shards published for {}/{name}",
            spec.hub_repo
        ))
    })
}
