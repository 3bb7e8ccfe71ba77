use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Local;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use serde_json::Value;

use crate::{
    arguments::TrainingArguments,
    checkpoint::{read_json, write_json},
    metrics::perplexity,
    state::{LogRecord, Logs, TrainerState},
    tensorboard::{scalar_tag, TensorBoardWriter},
    TrainingError,
};

pub const TRACKING_DIR: &str = "tracking";
pub const LATEST_RUN_LINK: &str = "latest-run";
pub const TRAINING_DUMP_FILE: &str = "training_dump.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const METADATA_FILE: &str = "metadata.json";
const TRACKING_ID_LEN: usize = 8;

/// Hooks invoked by the trainer at fixed points of the loop.
pub trait TrainerCallback {
    fn on_train_begin(
        &mut self,
        _args: &TrainingArguments,
        _state: &TrainerState,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_log(
        &mut self,
        _args: &TrainingArguments,
        _state: &TrainerState,
        _logs: &Logs,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_evaluate(
        &mut self,
        _args: &TrainingArguments,
        _state: &TrainerState,
        _metrics: &Logs,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_save(
        &mut self,
        _args: &TrainingArguments,
        _state: &TrainerState,
        _checkpoint: &Path,
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn on_train_end(
        &mut self,
        _args: &TrainingArguments,
        _state: &TrainerState,
    ) -> Result<(), TrainingError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub project: Option<String>,
    pub group: Option<String>,
    pub entity: Option<String>,
    pub tensorboard: bool,
    pub flush_every: usize,
    /// Identifier recovered from a previous launch of the same run.
    pub resume_id: Option<String>,
    /// Resolved launch configuration stored alongside the tracking metadata.
    pub config: Value,
}

#[derive(Debug, Serialize)]
struct TrackingMetadata<'a> {
    run_name: &'a str,
    project: Option<&'a str>,
    group: Option<&'a str>,
    entity: Option<&'a str>,
    tracking_id: &'a str,
    resumed: bool,
    started_at: String,
    config: &'a Value,
}

/// Local experiment tracker: a JSON run log, a metadata file and TensorBoard
/// scalars under the run directory.
pub struct ExperimentTrackingCallback {
    run_dir: PathBuf,
    settings: TrackingSettings,
    tracking_id: String,
    tracking_dir: Option<PathBuf>,
    dump: Vec<LogRecord>,
    summary: Logs,
    tensorboard: Option<TensorBoardWriter>,
}

impl ExperimentTrackingCallback {
    pub fn new(run_dir: impl Into<PathBuf>, settings: TrackingSettings) -> Self {
        let tracking_id = settings
            .resume_id
            .clone()
            .unwrap_or_else(generate_tracking_id);
        Self {
            run_dir: run_dir.into(),
            settings,
            tracking_id,
            tracking_dir: None,
            dump: Vec::new(),
            summary: Logs::new(),
            tensorboard: None,
        }
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn tracking_dir(&self) -> Option<&Path> {
        self.tracking_dir.as_deref()
    }

    pub fn dump_path(&self) -> PathBuf {
        self.run_dir.join(TRAINING_DUMP_FILE)
    }

    fn start_tracking_dir(&mut self) -> Result<PathBuf, TrainingError> {
        let base = self.run_dir.join(TRACKING_DIR);
        let name = format!(
            "run-{}-{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            self.tracking_id
        );
        let dir = base.join(&name);
        fs::create_dir_all(&dir)?;
        point_latest_run(&base, &name)?;
        Ok(dir)
    }

    fn load_dump(&mut self, resumed_step: usize) -> Result<(), TrainingError> {
        let path = self.dump_path();
        self.dump = if self.settings.resume_id.is_some() && path.is_file() {
            let mut records: Vec<LogRecord> = read_json(&path)?;
            records.retain(|record| record.step <= resumed_step);
            records
        } else {
            Vec::new()
        };
        for record in &self.dump {
            self.summary
                .extend(record.values.iter().map(|(key, value)| (key.clone(), *value)));
        }
        self.write_dump()
    }

    fn write_dump(&self) -> Result<(), TrainingError> {
        let path = self.dump_path();
        let staging = path.with_extension("json.tmp");
        write_json(&staging, &self.dump)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }
}

impl TrainerCallback for ExperimentTrackingCallback {
    fn on_train_begin(
        &mut self,
        args: &TrainingArguments,
        state: &TrainerState,
    ) -> Result<(), TrainingError> {
        if !state.is_world_process_zero {
            return Ok(());
        }
        let dir = self.start_tracking_dir()?;
        let metadata = TrackingMetadata {
            run_name: &args.run_name,
            project: self.settings.project.as_deref(),
            group: self.settings.group.as_deref(),
            entity: self.settings.entity.as_deref(),
            tracking_id: &self.tracking_id,
            resumed: self.settings.resume_id.is_some(),
            started_at: Local::now().to_rfc3339(),
            config: &self.settings.config,
        };
        write_json(&dir.join(METADATA_FILE), &metadata)?;
        if self.settings.tensorboard {
            self.tensorboard = Some(TensorBoardWriter::create(&dir, self.settings.flush_every)?);
        }
        self.load_dump(state.global_step)?;
        tracing::info!(
            tracking_id = %self.tracking_id,
            dir = %dir.display(),
            resumed = self.settings.resume_id.is_some(),
            "experiment tracking started"
        );
        self.tracking_dir = Some(dir);
        Ok(())
    }

    fn on_log(
        &mut self,
        _args: &TrainingArguments,
        state: &TrainerState,
        logs: &Logs,
    ) -> Result<(), TrainingError> {
        if !state.is_world_process_zero {
            return Ok(());
        }
        let mut values = logs.clone();
        if let Some(loss) = logs.get("loss") {
            values.insert("perplexity".into(), perplexity(*loss));
        }
        if let Some(loss) = logs.get("eval_loss") {
            values.entry("eval_perplexity".into()).or_insert(perplexity(*loss));
        }
        values.retain(|_, value| value.is_finite());

        if let Some(writer) = self.tensorboard.as_mut() {
            for (key, value) in &values {
                if let Err(err) = writer.write_scalar(&scalar_tag(key), state.global_step as i64, *value) {
                    tracing::warn!(error = %err, "dropping tensorboard scalar");
                }
            }
        }

        self.summary
            .extend(values.iter().map(|(key, value)| (key.clone(), *value)));
        self.dump.push(LogRecord {
            step: state.global_step,
            epoch: crate::state::round_epoch(state.epoch),
            values,
        });
        self.write_dump()
    }

    fn on_train_end(
        &mut self,
        _args: &TrainingArguments,
        state: &TrainerState,
    ) -> Result<(), TrainingError> {
        if !state.is_world_process_zero {
            return Ok(());
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            writer.flush()?;
        }
        if let Some(dir) = &self.tracking_dir {
            write_json(&dir.join(SUMMARY_FILE), &self.summary)?;
        }
        Ok(())
    }
}

/// Tracking id of the previous launch: the suffix after the last `-` of the
/// directory `tracking/latest-run` points at.
pub fn resume_tracking_id(run_dir: &Path) -> Option<String> {
    let link = run_dir.join(TRACKING_DIR).join(LATEST_RUN_LINK);
    let target = match fs::read_link(&link) {
        Ok(target) => target.to_string_lossy().into_owned(),
        Err(_) => fs::read_to_string(&link).ok()?.trim().to_string(),
    };
    let name = Path::new(&target).file_name()?.to_string_lossy().into_owned();
    let id = name.rsplit('-').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

fn generate_tracking_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRACKING_ID_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}

#[cfg(unix)]
fn point_latest_run(base: &Path, name: &str) -> Result<(), TrainingError> {
    let link = base.join(LATEST_RUN_LINK);
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(name, &link)?;
    Ok(())
}

#[cfg(not(unix))]
fn point_latest_run(base: &Path, name: &str) -> Result<(), TrainingError> {
    fs::write(base.join(LATEST_RUN_LINK), name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(resume_id: Option<String>) -> TrackingSettings {
        TrackingSettings {
            project: Some("gpt2".into()),
            group: None,
            entity: None,
            tensorboard: true,
            flush_every: 1,
            resume_id,
            config: serde_json::json!({"seed": 21}),
        }
    }

    fn state(step: usize) -> TrainerState {
        TrainerState {
            global_step: step,
            is_world_process_zero: true,
            ..TrainerState::default()
        }
    }

    #[test]
    fn tracking_id_survives_a_relaunch() {
        let run_dir = tempfile::tempdir().unwrap();
        let args = TrainingArguments::default();

        let mut first = ExperimentTrackingCallback::new(run_dir.path(), settings(None));
        first.on_train_begin(&args, &state(0)).unwrap();
        let id = first.tracking_id().to_string();
        assert_eq!(id.len(), TRACKING_ID_LEN);
        assert!(first.tracking_dir().unwrap().join(METADATA_FILE).is_file());

        assert_eq!(resume_tracking_id(run_dir.path()), Some(id));
    }

    #[test]
    fn resume_truncates_the_run_log() {
        let run_dir = tempfile::tempdir().unwrap();
        let args = TrainingArguments::default();

        let mut first = ExperimentTrackingCallback::new(run_dir.path(), settings(None));
        first.on_train_begin(&args, &state(0)).unwrap();
        for step in [10, 20, 30] {
            let logs = Logs::from([("loss".to_string(), 2.0)]);
            first.on_log(&args, &state(step), &logs).unwrap();
        }
        first.on_train_end(&args, &state(30)).unwrap();
        let summary: Logs = read_json(&first.tracking_dir().unwrap().join(SUMMARY_FILE)).unwrap();
        assert!((summary["perplexity"] - 2f64.exp()).abs() < 1e-9);

        let id = resume_tracking_id(run_dir.path());
        let mut second = ExperimentTrackingCallback::new(run_dir.path(), settings(id.clone()));
        second.on_train_begin(&args, &state(20)).unwrap();
        assert_eq!(Some(second.tracking_id().to_string()), id);

        let records: Vec<LogRecord> = read_json(&second.dump_path()).unwrap();
        assert_eq!(records.iter().map(|r| r.step).collect::<Vec<_>>(), vec![10, 20]);
    }

    #[test]
    fn secondary_processes_write_nothing() {
        let run_dir = tempfile::tempdir().unwrap();
        let args = TrainingArguments::default();
        let mut callback = ExperimentTrackingCallback::new(run_dir.path(), settings(None));
        let secondary = TrainerState::default();
        callback.on_train_begin(&args, &secondary).unwrap();
        callback
            .on_log(&args, &secondary, &Logs::from([("loss".to_string(), 1.0)]))
            .unwrap();
        assert!(!run_dir.path().join(TRAINING_DUMP_FILE).exists());
        assert!(resume_tracking_id(run_dir.path()).is_none());
    }
}
