use std::fs;
use std::path::{Path, PathBuf};

use corpora::{get_auto_dataset, DatasetRequest, LocalFiles};
use serde_json::json;
use tokenizers::Tokenizer;

fn word_level(words: &[&str]) -> Tokenizer {
    let mut vocab = serde_json::Map::new();
    vocab.insert("[UNK]".into(), json!(0));
    for (idx, word) in words.iter().enumerate() {
        vocab.insert((*word).into(), json!(idx + 1));
    }
    let spec = json!({
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
    Tokenizer::from_bytes(serde_json::to_vec(&spec).unwrap()).unwrap()
}

fn write_lines(path: &Path, lines: &[&str]) -> PathBuf {
    fs::write(path, lines.join("\n")).unwrap();
    path.to_path_buf()
}

fn request(root: &Path, dataset_id: &str, seq_len: usize, files: LocalFiles) -> DatasetRequest {
    DatasetRequest {
        dataset_id: dataset_id.into(),
        name: None,
        validation_ratio: 0.25,
        seq_len,
        num_proc: 1,
        files: Some(files),
        dataset_dir: root.join("cache").join("datasets"),
        preprocessed_dir: root.join("cache").join("gpt2-small").join("preprocessed"),
    }
}

const WORDS: &[&str] = &["a", "b", "c", "d", "e"];

#[test]
fn explicit_validation_split_is_grouped_separately() {
    let tmp = tempfile::tempdir().unwrap();
    let train = write_lines(&tmp.path().join("train.txt"), &["a b c d e"; 3]);
    let validation = write_lines(&tmp.path().join("valid.txt"), &["e d c b a", "a a"]);
    let tokenizer = word_level(WORDS);

    let datasets = get_auto_dataset(
        &tokenizer,
        "digest",
        &request(
            tmp.path(),
            "wikitext",
            4,
            LocalFiles {
                train: vec![train],
                validation: Some(vec![validation]),
            },
        ),
    )
    .unwrap();

    assert_eq!(datasets.train.len(), 3);
    assert_eq!(datasets.validation.len(), 1);
    assert_eq!(datasets.validation.block(0).unwrap(), vec![5, 4, 3, 2]);
    assert_eq!(datasets.train.block(1).unwrap(), vec![5, 1, 2, 3]);
    assert_eq!(datasets.metadata.train.documents, 3);
    assert!(datasets.cache_dir.parent().unwrap().ends_with("wikitext"));
    let leaf = datasets.cache_dir.file_name().unwrap().to_string_lossy().into_owned();
    assert!(leaf.starts_with("wikitext-103-raw-v1-seq=4-val=0.25-src="), "{leaf}");
}

#[test]
fn validation_is_carved_from_leading_training_documents() {
    let tmp = tempfile::tempdir().unwrap();
    let train = write_lines(
        &tmp.path().join("owt.txt"),
        &["e e e e e", "a b c d e", "a b c d e", "a b c d e"],
    );
    let tokenizer = word_level(WORDS);

    let datasets = get_auto_dataset(
        &tokenizer,
        "digest",
        &request(
            tmp.path(),
            "openwebtext",
            4,
            LocalFiles {
                train: vec![train],
                validation: None,
            },
        ),
    )
    .unwrap();

    assert_eq!(datasets.metadata.validation.documents, 1);
    assert_eq!(datasets.validation.len(), 1);
    assert_eq!(datasets.validation.block(0).unwrap(), vec![5, 5, 5, 5]);
    assert_eq!(datasets.train.len(), 3);
}

#[test]
fn matching_cache_is_reused_and_key_changes_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    let train = write_lines(&tmp.path().join("train.txt"), &["a b c d e"; 4]);
    let tokenizer = word_level(WORDS);
    let files = LocalFiles {
        train: vec![train],
        validation: None,
    };

    let first = get_auto_dataset(&tokenizer, "digest", &request(tmp.path(), "openwebtext", 4, files.clone()))
        .unwrap();
    let reused = get_auto_dataset(&tokenizer, "digest", &request(tmp.path(), "openwebtext", 4, files.clone()))
        .unwrap();
    assert_eq!(first.metadata, reused.metadata);
    assert_eq!(reused.cache_dir, first.cache_dir);

    let rebuilt = get_auto_dataset(&tokenizer, "other", &request(tmp.path(), "openwebtext", 4, files))
        .unwrap();
    assert_eq!(rebuilt.metadata.key.tokenizer_sha256, "other");
}

#[test]
fn different_source_files_never_reuse_blocks() {
    let tmp = tempfile::tempdir().unwrap();
    let small = write_lines(&tmp.path().join("small.txt"), &["a b c d"; 4]);
    let big = write_lines(&tmp.path().join("big.txt"), &["e e e e"; 40]);
    let tokenizer = word_level(WORDS);
    let local = |train: PathBuf| LocalFiles {
        train: vec![train],
        validation: None,
    };

    let first = get_auto_dataset(&tokenizer, "digest", &request(tmp.path(), "wikitext", 4, local(small.clone())))
        .unwrap();
    assert_eq!(first.train.block(0).unwrap(), vec![1, 2, 3, 4]);

    let second = get_auto_dataset(&tokenizer, "digest", &request(tmp.path(), "wikitext", 4, local(big)))
        .unwrap();
    assert_ne!(second.cache_dir, first.cache_dir);
    assert_ne!(second.metadata.key.source_sha256, first.metadata.key.source_sha256);
    assert_eq!(second.train.block(0).unwrap(), vec![5, 5, 5, 5]);

    // Rewriting a shard in place changes its size, so the cache is rebuilt.
    write_lines(&small, &["e d c b"; 8]);
    let rewritten = get_auto_dataset(&tokenizer, "digest", &request(tmp.path(), "wikitext", 4, local(small)))
        .unwrap();
    assert_eq!(rewritten.train.block(0).unwrap(), vec![5, 4, 3, 2]);
}

#[test]
fn local_files_work_under_an_unregistered_id() {
    let tmp = tempfile::tempdir().unwrap();
    let train = write_lines(&tmp.path().join("c.txt"), &["a b c d"; 4]);
    let tokenizer = word_level(WORDS);

    let datasets = get_auto_dataset(
        &tokenizer,
        "digest",
        &request(
            tmp.path(),
            "mycorpus",
            4,
            LocalFiles {
                train: vec![train],
                validation: None,
            },
        ),
    )
    .unwrap();
    assert_eq!(datasets.metadata.key.dataset_id, "mycorpus");
    assert_eq!(datasets.metadata.key.name, corpora::auto::LOCAL_NAME);
    assert!(datasets.cache_dir.parent().unwrap().ends_with("mycorpus"));
    assert!(!datasets.train.is_empty());
}

#[test]
fn corpus_too_short_for_one_block_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let train = write_lines(&tmp.path().join("train.txt"), &["a b", "c"]);
    let tokenizer = word_level(WORDS);

    let err = get_auto_dataset(
        &tokenizer,
        "digest",
        &request(
            tmp.path(),
            "wikitext",
            8,
            LocalFiles {
                train: vec![train],
                validation: None,
            },
        ),
    )
    .unwrap_err();
    assert!(err.to_string().contains("no blocks"));
}

#[test]
fn unknown_dataset_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut hub_request = request(tmp.path(), "c4", 4, LocalFiles::default());
    hub_request.files = None;
    let err = get_auto_dataset(&word_level(WORDS), "digest", &hub_request).unwrap_err();
    assert!(matches!(err, corpora::Error::UnknownDataset { .. }));
}
