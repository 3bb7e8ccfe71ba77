use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a tokenizer was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerSource {
    /// A `tokenizer.json` supplied by the user.
    File { path: PathBuf },
    /// The `tokenizer.json` published by a hub model repository.
    Hub { repo: String },
}

/// Written next to the cached tokenizer so later runs can detect a changed vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub source: TokenizerSource,
    pub sha256: String,
    pub vocab_size: usize,
    pub created_at: String,
}
