use crate::errors::{Error, Result};
use crate::types::ArtifactManifest;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tokenizers::Tokenizer;

const TOKENIZER_JSON_ERR: &str = "tokenizer json not found at";
const MANIFEST_ERR: &str = "manifest not found at";

pub fn load_tokenizer_from_json(path: &Path) -> Result<Tokenizer> {
    ensure_file(path, TOKENIZER_JSON_ERR)?;
    Tokenizer::from_file(path).map_err(Error::from)
}

pub fn save_tokenizer_json(tok: &Tokenizer, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    tok.save(path, false).map_err(Error::from)
}

pub fn write_manifest(manifest_path: &Path, manifest: &ArtifactManifest) -> Result<()> {
    if let Some(parent) = manifest_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(manifest_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, manifest)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub fn read_manifest(manifest_path: &Path) -> Result<ArtifactManifest> {
    ensure_file(manifest_path, MANIFEST_ERR)?;
    let file = File::open(manifest_path)?;
    let reader = BufReader::new(file);
    let manifest = serde_json::from_reader(reader)?;
    Ok(manifest)
}

/// SHA-256 of the tokenizer's canonical (compact) JSON serialization.
pub fn fingerprint(tok: &Tokenizer) -> Result<String> {
    let serialized = tok.to_string(false)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn ensure_file(path: &Path, context: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Artifact(format!("{context} {}", path.display())))
    }
}
