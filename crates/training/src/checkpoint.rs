use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use model::Gpt2LmHeadModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    arguments::TrainingArguments,
    optimizer::{TrainerOptimizer, OPTIMIZER_MOMENTS_FILE, OPTIMIZER_STATE_FILE},
    scheduler::{LRScheduler, SchedulerState},
    state::TrainerState,
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const TRAINER_STATE_FILENAME: &str = "trainer_state.json";
const TRAINING_ARGS_FILENAME: &str = "training_args.json";
const RNG_STATE_FILENAME: &str = "rng_state.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Seeds needed to reproduce the data order after a resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
    pub epoch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub global_step: usize,
    pub files: Vec<FileRecord>,
}

pub struct SaveRequest<'a> {
    pub output_dir: &'a Path,
    pub model: &'a Gpt2LmHeadModel,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub state: &'a TrainerState,
    pub args: &'a TrainingArguments,
    pub rng: RngState,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Everything read back from a validated checkpoint directory. Weights and
/// optimizer moments stay on disk until applied by the trainer.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub state: TrainerState,
    pub scheduler: SchedulerState,
    pub rng: RngState,
}

impl LoadedCheckpoint {
    pub fn weights_path(&self) -> PathBuf {
        self.directory.join(model::model::WEIGHTS_FILENAME)
    }
}

pub fn checkpoint_dir_name(global_step: usize) -> String {
    format!("{CHECKPOINT_PREFIX}-{global_step}")
}

/// Step encoded in a `checkpoint-<digits>` directory name.
pub fn parse_checkpoint_step(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(CHECKPOINT_PREFIX)?.strip_prefix('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    let checkpoint_dir = request
        .output_dir
        .join(checkpoint_dir_name(request.state.global_step));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir_all(&checkpoint_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    request
        .model
        .save_pretrained(&checkpoint_dir)
        .map_err(|err| TrainingError::checkpoint(format!("failed to save model: {err}")))?;
    request.optimizer.save_state(&checkpoint_dir)?;
    write_json(
        &checkpoint_dir.join(SCHEDULER_FILENAME),
        &request.scheduler.snapshot(),
    )?;
    write_json(&checkpoint_dir.join(TRAINER_STATE_FILENAME), request.state)?;
    write_json(&checkpoint_dir.join(TRAINING_ARGS_FILENAME), request.args)?;
    write_json(&checkpoint_dir.join(RNG_STATE_FILENAME), &request.rng)?;

    let mut files = Vec::new();
    for filename in [
        model::model::WEIGHTS_FILENAME,
        model::model::CONFIG_FILENAME,
        OPTIMIZER_STATE_FILE,
        OPTIMIZER_MOMENTS_FILE,
        SCHEDULER_FILENAME,
        TRAINER_STATE_FILENAME,
        TRAINING_ARGS_FILENAME,
        RNG_STATE_FILENAME,
    ] {
        files.push(file_record(&checkpoint_dir, filename)?);
    }

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        global_step: request.state.global_step,
        files,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// The `checkpoint-<n>` sub-directory of `dir` with the largest `n`.
pub fn get_last_checkpoint(dir: &Path) -> Result<Option<PathBuf>, TrainingError> {
    Ok(checkpoint_directories(dir)?
        .into_iter()
        .max_by_key(|(step, _)| *step)
        .map(|(_, path)| path))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadedCheckpoint, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(&manifest_path)?;
    ensure_version_supported(manifest.version)?;

    for record in &manifest.files {
        validate_file(&directory.join(&record.filename), record)?;
    }

    let state: TrainerState = read_json(&directory.join(TRAINER_STATE_FILENAME))?;
    if state.global_step != manifest.global_step {
        return Err(TrainingError::checkpoint(format!(
            "trainer state step {} disagrees with manifest step {}",
            state.global_step, manifest.global_step
        )));
    }

    Ok(LoadedCheckpoint {
        directory: directory.to_path_buf(),
        state,
        scheduler: read_json(&directory.join(SCHEDULER_FILENAME))?,
        rng: read_json(&directory.join(RNG_STATE_FILENAME))?,
        manifest,
    })
}

/// Deletes the oldest checkpoints so at most `limit` remain.
pub fn rotate_checkpoints(output_dir: &Path, limit: Option<usize>) -> Result<Vec<PathBuf>, TrainingError> {
    let Some(limit) = limit.filter(|limit| *limit > 0) else {
        return Ok(Vec::new());
    };
    let mut dirs = checkpoint_directories(output_dir)?;
    dirs.sort_by_key(|(step, _)| *step);
    let excess = dirs.len().saturating_sub(limit);
    let mut removed = Vec::with_capacity(excess);
    for (_, victim) in dirs.into_iter().take(excess) {
        tracing::info!(
            checkpoint = %victim.display(),
            "deleting older checkpoint due to save_total_limit"
        );
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
        removed.push(victim);
    }
    Ok(removed)
}

fn checkpoint_directories(base: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.is_dir() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(step) = parse_checkpoint_step(&name.to_string_lossy()) {
            dirs.push((step, entry.path()));
        }
    }
    Ok(dirs)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(dir: &Path, filename: &str) -> Result<FileRecord, TrainingError> {
    let path = dir.join(filename);
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    Ok(FileRecord {
        filename: filename.to_string(),
        sha256: sha256_file(&path)?,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} is missing",
            path.display()
        )));
    }
    let actual = sha256_file(path)?;
    if actual != record.sha256 {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
        })
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_checkpoint_names_count() {
        assert_eq!(parse_checkpoint_step("checkpoint-500"), Some(500));
        assert_eq!(parse_checkpoint_step("checkpoint-"), None);
        assert_eq!(parse_checkpoint_step("checkpoint-12a"), None);
        assert_eq!(parse_checkpoint_step("checkpoint_12"), None);
        assert_eq!(parse_checkpoint_step("tmp-checkpoint-12"), None);
    }

    #[test]
    fn last_checkpoint_orders_numerically() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(get_last_checkpoint(dir.path()).unwrap(), None);
        for name in ["checkpoint-9", "checkpoint-10", "checkpoint-2", "checkpoint-final"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("checkpoint-99"), b"not a dir").unwrap();

        assert_eq!(
            get_last_checkpoint(dir.path()).unwrap(),
            Some(dir.path().join("checkpoint-10"))
        );
        assert_eq!(
            get_last_checkpoint(&dir.path().join("missing")).unwrap(),
            None
        );
    }

    #[test]
    fn rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for step in [5, 10, 15, 20] {
            fs::create_dir(dir.path().join(checkpoint_dir_name(step))).unwrap();
        }
        let removed = rotate_checkpoints(dir.path(), Some(2)).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!dir.path().join("checkpoint-5").exists());
        assert!(!dir.path().join("checkpoint-10").exists());
        assert!(dir.path().join("checkpoint-20").is_dir());
        assert!(rotate_checkpoints(dir.path(), None).unwrap().is_empty());
    }
}
