//! Pretrained tokenizer resolution for the training launcher.
//!
//! A tokenizer comes either from a user supplied `tokenizer.json` or from the
//! `tokenizer.json` published by a hub model repository (fetched once into the
//! run cache). Training a tokenizer from scratch is not supported.
//!
//! Every resolved tokenizer is fingerprinted with SHA-256 and described by a
//! `manifest.json` in the tokenizer cache directory. Downstream caches (the
//! tokenized dataset) key on that fingerprint.

pub mod artifacts;
pub mod errors;
pub mod hub;
pub mod types;

use std::path::PathBuf;

use tokenizers::Tokenizer;

pub use errors::{Error, Result};
pub use types::{ArtifactManifest, TokenizerSource};

pub const MANIFEST_FILE: &str = "manifest.json";

/// What to load and where to cache it.
#[derive(Debug, Clone)]
pub struct TokenizerRequest {
    /// Hub repository publishing the model's tokenizer (e.g. `gpt2`).
    pub hub_id: String,
    pub pretrained: bool,
    /// Local `tokenizer.json`; takes precedence over the hub.
    pub tokenizer_file: Option<PathBuf>,
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResolvedTokenizer {
    pub tokenizer: Tokenizer,
    pub source: TokenizerSource,
    pub fingerprint: String,
}

impl ResolvedTokenizer {
    /// Vocabulary size including added tokens, the size the embedding matrix must cover.
    pub fn len(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn resolve(request: &TokenizerRequest) -> Result<ResolvedTokenizer> {
    let (path, source) = match &request.tokenizer_file {
        Some(path) => (
            path.clone(),
            TokenizerSource::File { path: path.clone() },
        ),
        None if request.pretrained => (
            hub::fetch_tokenizer_json(&request.hub_id, &request.cache_dir)?,
            TokenizerSource::Hub {
                repo: request.hub_id.clone(),
            },
        ),
        None => {
            return Err(Error::Unsupported(
                "training a tokenizer from scratch is not implemented; set model.pretrained_tokenizer or model.tokenizer_file",
            ))
        }
    };

    let tokenizer = artifacts::load_tokenizer_from_json(&path)?;
    validate(&tokenizer)?;
    let fingerprint = artifacts::fingerprint(&tokenizer)?;

    let manifest_path = request.cache_dir.join(MANIFEST_FILE);
    if let Ok(previous) = artifacts::read_manifest(&manifest_path) {
        if previous.sha256 != fingerprint {
            tracing::warn!(
                previous = %previous.sha256,
                current = %fingerprint,
                "tokenizer differs from the one recorded in the cache"
            );
        }
    }
    let manifest = ArtifactManifest {
        source: source.clone(),
        sha256: fingerprint.clone(),
        vocab_size: tokenizer.get_vocab_size(true),
        created_at: chrono::Local::now().to_rfc3339(),
    };
    artifacts::write_manifest(&manifest_path, &manifest)?;

    tracing::info!(
        vocab_size = manifest.vocab_size,
        sha256 = %fingerprint,
        "tokenizer ready"
    );
    Ok(ResolvedTokenizer {
        tokenizer,
        source,
        fingerprint,
    })
}

fn validate(tokenizer: &Tokenizer) -> Result<()> {
    if tokenizer.get_vocab_size(true) == 0 {
        return Err(Error::Validation("tokenizer vocabulary is empty".into()));
    }
    if tokenizer.get_padding().is_some() {
        return Err(Error::Validation(
            "tokenizer enables padding; sequences are packed and must not be padded".into(),
        ));
    }
    Ok(())
}
