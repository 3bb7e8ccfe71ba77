use std::path::{Path, PathBuf};

use hf_hub::{api::sync::ApiBuilder, Cache};

use crate::errors::Result;

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Returns the local path of `repo`'s `tokenizer.json`, downloading it into
/// `cache_dir` unless a previous run already did.
pub fn fetch_tokenizer_json(repo: &str, cache_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = Cache::new(cache_dir.to_path_buf())
        .model(repo.to_string())
        .get(TOKENIZER_FILE)
    {
        tracing::debug!(repo, path = %path.display(), "tokenizer found in cache");
        return Ok(path);
    }

    tracing::info!(repo, cache = %cache_dir.display(), "downloading tokenizer from the hub");
    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_progress(false)
        .build()?;
    let path = api.model(repo.to_string()).get(TOKENIZER_FILE)?;
    Ok(path)
}
