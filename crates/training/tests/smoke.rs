use std::{
    fs,
    path::Path,
    sync::{atomic::AtomicBool, Arc},
};

use candle_core::{safetensors, Device};
use serde_json::json;
use tempfile::tempdir;
use training::{
    callbacks::{resume_tracking_id, TRAINING_DUMP_FILE},
    checkpoint::get_last_checkpoint,
    config::LaunchConfig,
    launch,
    state::{LogRecord, TrainerState},
    ConfigOverride, TrainingError,
};

const WORDS: &[&str] = &["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog"];

fn write_tokenizer(path: &Path) {
    let mut vocab = serde_json::Map::new();
    vocab.insert("[UNK]".into(), json!(0));
    for (idx, word) in WORDS.iter().enumerate() {
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
    fs::write(path, serde_json::to_vec_pretty(&spec).unwrap()).unwrap();
}

fn write_corpus(path: &Path, lines: usize) {
    let text = (0..lines)
        .map(|i| {
            let mut words = WORDS.to_vec();
            words.rotate_left(i % WORDS.len());
            words.join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(path, text).unwrap();
}

fn write_config(base: &Path) -> std::path::PathBuf {
    write_tokenizer(&base.join("tokenizer.json"));
    write_corpus(&base.join("train.txt"), 48);
    write_corpus(&base.join("valid.txt"), 8);

    let config = r#"
run_id: smoke
seed: 7
log_level: warning
model:
  id: gpt2-small
  seq_len: 8
  tokenizer_file: tokenizer.json
  overrides:
    n_positions: 16
    n_embd: 16
    n_layer: 1
    n_head: 2
dataset:
  id: wikitext
  files:
    train: [train.txt]
    validation: [valid.txt]
artifacts:
  cache_dir: cache
  run_dir: runs
training_arguments:
  per_device_train_batch_size: 4
  per_device_eval_batch_size: 4
  gradient_accumulation_steps: 2
  learning_rate: 0.001
  max_steps: 4
  logging_steps: 1
  save_steps: 2
  save_total_limit: 2
  eval_steps: 2
  max_eval_batches: 1
tracking:
  project: smoke
"#;
    let path = base.join("launch.yaml");
    fs::write(&path, config).unwrap();
    path
}

fn read_dump(run_dir: &Path) -> Vec<LogRecord> {
    serde_json::from_slice(&fs::read(run_dir.join(TRAINING_DUMP_FILE)).unwrap()).unwrap()
}

fn loss_steps(records: &[LogRecord]) -> Vec<usize> {
    records
        .iter()
        .filter(|record| record.values.contains_key("loss"))
        .map(|record| record.step)
        .collect()
}

#[test]
fn smoke_training_checkpoint_resume() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path());
    let run_dir = tmp.path().join("runs").join("smoke");

    let config = LaunchConfig::load(&config_path).unwrap();
    let first = launch::run(&config, Arc::new(AtomicBool::new(false))).unwrap();
    let output = first.train_output.as_ref().unwrap();
    assert_eq!(output.global_step, 4);
    assert!(output.training_loss.is_finite());
    assert!(output.metrics.contains_key("train_runtime"));
    assert!(run_dir.join("model.safetensors").is_file());
    assert!(run_dir.join("tokenizer.json").is_file());

    let last = get_last_checkpoint(&run_dir).unwrap().unwrap();
    assert_eq!(last, run_dir.join("checkpoint-4"));
    assert!(run_dir.join("checkpoint-2").is_dir());
    let state: TrainerState =
        serde_json::from_slice(&fs::read(last.join("trainer_state.json")).unwrap()).unwrap();
    assert_eq!(state.global_step, 4);
    assert!(state
        .log_history
        .iter()
        .any(|record| record.values.contains_key("eval_loss")));

    let dump = read_dump(&run_dir);
    assert_eq!(loss_steps(&dump), vec![1, 2, 3, 4]);
    let tracking_id = resume_tracking_id(&run_dir).unwrap();

    let overrides: Vec<ConfigOverride> = vec!["training_arguments.max_steps=6".parse().unwrap()];
    let mut config = LaunchConfig::load_with_overrides(&config_path, &overrides).unwrap();
    config.resume = true;
    let second = launch::run(&config, Arc::new(AtomicBool::new(false))).unwrap();
    assert_eq!(second.resumed_from.as_deref(), Some(last.as_path()));
    assert_eq!(second.train_output.as_ref().unwrap().global_step, 6);
    assert_eq!(resume_tracking_id(&run_dir), Some(tracking_id));

    assert_eq!(
        get_last_checkpoint(&run_dir).unwrap(),
        Some(run_dir.join("checkpoint-6"))
    );
    assert!(!run_dir.join("checkpoint-2").exists());
    assert_eq!(loss_steps(&read_dump(&run_dir)), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn resume_without_checkpoint_fails() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path());
    let mut config = LaunchConfig::load(&config_path).unwrap();
    config.resume = true;

    let err = launch::run(&config, Arc::new(AtomicBool::new(false))).unwrap_err();
    assert!(matches!(err, TrainingError::Checkpoint(_)));
    assert!(err
        .to_string()
        .contains("Cannot detect checkpoint in run dir. Resuming failed."));
}

#[test]
fn stop_flag_writes_a_resumable_checkpoint() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path());
    let overrides: Vec<ConfigOverride> = vec![
        "training_arguments.save_steps=100".parse().unwrap(),
        "run_id=stopped".parse().unwrap(),
    ];
    let config = LaunchConfig::load_with_overrides(&config_path, &overrides).unwrap();

    let outcome = launch::run(&config, Arc::new(AtomicBool::new(true))).unwrap();
    assert_eq!(outcome.train_output.unwrap().global_step, 1);
    let run_dir = tmp.path().join("runs").join("stopped");
    assert_eq!(
        get_last_checkpoint(&run_dir).unwrap(),
        Some(run_dir.join("checkpoint-1"))
    );
}

fn deterministic_overrides(run_id: &str, max_steps: usize) -> Vec<ConfigOverride> {
    [
        format!("run_id={run_id}"),
        format!("training_arguments.max_steps={max_steps}"),
        "training_arguments.lr_scheduler_type=constant".to_string(),
        "training_arguments.save_total_limit=null".to_string(),
        "model.overrides.resid_pdrop=0".to_string(),
        "model.overrides.embd_pdrop=0".to_string(),
        "model.overrides.attn_pdrop=0".to_string(),
    ]
    .iter()
    .map(|raw| raw.parse().unwrap())
    .collect()
}

#[test]
fn resumed_run_matches_uninterrupted_weights() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path());

    let straight = LaunchConfig::load_with_overrides(&config_path, &deterministic_overrides("straight", 8))
        .unwrap();
    launch::run(&straight, Arc::new(AtomicBool::new(false))).unwrap();

    let early = LaunchConfig::load_with_overrides(&config_path, &deterministic_overrides("resumed", 2))
        .unwrap();
    launch::run(&early, Arc::new(AtomicBool::new(false))).unwrap();
    let mut resumed = LaunchConfig::load_with_overrides(&config_path, &deterministic_overrides("resumed", 8))
        .unwrap();
    resumed.resume = true;
    let outcome = launch::run(&resumed, Arc::new(AtomicBool::new(false))).unwrap();
    assert_eq!(outcome.train_output.unwrap().global_step, 8);

    let runs = tmp.path().join("runs");
    let expected = safetensors::load(runs.join("straight").join("model.safetensors"), &Device::Cpu).unwrap();
    let actual = safetensors::load(runs.join("resumed").join("model.safetensors"), &Device::Cpu).unwrap();
    assert_eq!(expected.len(), actual.len());
    for (name, want) in &expected {
        let got = &actual[name];
        assert_eq!(want.dims(), got.dims(), "{name}");
        let diff = (want - got)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff <= 1e-6, "{name} differs by {diff}");
    }
}

#[test]
fn oversized_sequence_fails_before_dataset_preparation() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path());
    let overrides: Vec<ConfigOverride> = vec!["model.seq_len=32".parse().unwrap()];
    let config = LaunchConfig::load_with_overrides(&config_path, &overrides).unwrap();

    let err = launch::run(&config, Arc::new(AtomicBool::new(false))).unwrap_err();
    assert!(matches!(err, TrainingError::Initialization(_)));
    assert!(err.to_string().contains("exceeds"));

    let preprocessed = tmp.path().join("cache").join("gpt2-small").join("preprocessed");
    assert_eq!(fs::read_dir(preprocessed).unwrap().count(), 0);
}
