use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tokenizer::errors::Result;
use tokenizer::{resolve, Error, TokenizerRequest, TokenizerSource};

fn write_word_level(path: &Path, words: &[&str]) {
    let mut vocab = serde_json::Map::new();
    vocab.insert("[UNK]".into(), json!(0));
    for (idx, word) in words.iter().enumerate() {
        vocab.insert((*word).into(), json!(idx + 1));
    }
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
    });
    fs::write(path, serde_json::to_vec_pretty(&tokenizer).unwrap()).unwrap();
}

fn request(file: Option<PathBuf>, pretrained: bool, cache_dir: &Path) -> TokenizerRequest {
    TokenizerRequest {
        hub_id: "gpt2".into(),
        pretrained,
        tokenizer_file: file,
        cache_dir: cache_dir.to_path_buf(),
    }
}

#[test]
fn local_file_is_loaded_and_recorded() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("tokenizer.json");
    write_word_level(&file, &["the", "quick", "fox"]);
    let cache = tmp.path().join("cache");

    let resolved = resolve(&request(Some(file.clone()), true, &cache))?;
    assert_eq!(resolved.len(), 4);
    assert_eq!(resolved.source, TokenizerSource::File { path: file });

    let manifest = tokenizer::artifacts::read_manifest(&cache.join("manifest.json"))?;
    assert_eq!(manifest.sha256, resolved.fingerprint);
    assert_eq!(manifest.vocab_size, 4);

    let encoding = resolved.tokenizer.encode("the fox", false)?;
    assert_eq!(encoding.get_ids(), &[1, 3]);
    Ok(())
}

#[test]
fn fingerprint_tracks_vocabulary() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = tmp.path().join("cache");
    let a = tmp.path().join("a.json");
    let b = tmp.path().join("b.json");
    write_word_level(&a, &["alpha", "beta"]);
    write_word_level(&b, &["alpha", "gamma"]);

    let first = resolve(&request(Some(a.clone()), true, &cache))?;
    let again = resolve(&request(Some(a), true, &cache))?;
    let other = resolve(&request(Some(b), true, &cache))?;

    assert_eq!(first.fingerprint, again.fingerprint);
    assert_ne!(first.fingerprint, other.fingerprint);
    Ok(())
}

#[test]
fn scratch_tokenizer_is_unsupported() {
    let tmp = tempfile::tempdir().unwrap();
    let err = resolve(&request(None, false, tmp.path())).unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[test]
fn hub_tokenizer_is_served_from_cache() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cache = tmp.path().to_path_buf();
    let repo_dir = cache.join("models--gpt2");
    let commit = "0123456789abcdef";
    fs::create_dir_all(repo_dir.join("refs"))?;
    fs::write(repo_dir.join("refs").join("main"), commit)?;
    let snapshot = repo_dir.join("snapshots").join(commit);
    fs::create_dir_all(&snapshot)?;
    write_word_level(&snapshot.join("tokenizer.json"), &["hello", "world"]);

    let resolved = resolve(&request(None, true, &cache))?;
    assert_eq!(
        resolved.source,
        TokenizerSource::Hub {
            repo: "gpt2".into()
        }
    );
    assert_eq!(resolved.len(), 3);
    Ok(())
}
