use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use walkdir::WalkDir;

use crate::config::{LaunchConfig, TrainingError};

/// Mode applied to run and cache trees so collaborators in a shared group can
/// read and clean them up.
pub const SHARED_MODE: u32 = 0o775;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub runs: PathBuf,
    pub cache: PathBuf,
    pub configs: PathBuf,
    pub tokenizer: PathBuf,
    pub dataset: PathBuf,
    pub preprocessed: PathBuf,
}

impl RunPaths {
    /// The log file kept inside the run directory.
    pub fn log_file(&self, run_id: &str) -> PathBuf {
        self.runs.join(format!("{run_id}.log"))
    }
}

/// Configured run id, or `{model}-d={dataset}-n={nodes}-g={gpus}+{timestamp}`.
pub fn resolve_run_id(config: &LaunchConfig) -> String {
    match &config.run_id {
        Some(run_id) => run_id.clone(),
        None => format!(
            "{}-d={}-n={}-g={}+{}",
            config.model.id,
            config.dataset.id,
            config.infra.nodes,
            config.infra.gpus,
            Local::now().format("%Y-%m-%d-%H:%M:%S")
        ),
    }
}

pub fn create_paths(
    run_id: &str,
    model_id: &str,
    run_dir: &Path,
    cache_dir: &Path,
) -> Result<RunPaths, TrainingError> {
    let model_cache = cache_dir.join(model_id);
    let paths = RunPaths {
        runs: run_dir.join(run_id),
        cache: cache_dir.to_path_buf(),
        configs: model_cache.join("configs"),
        tokenizer: model_cache.join("tokenizer"),
        dataset: cache_dir.join("datasets"),
        preprocessed: model_cache.join("preprocessed"),
    };
    for dir in [
        &paths.runs,
        &paths.cache,
        &paths.configs,
        &paths.tokenizer,
        &paths.dataset,
        &paths.preprocessed,
    ] {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to create directory {}: {}",
                dir.display(),
                err
            ))
        })?;
    }
    Ok(paths)
}

/// Recursively opens up permissions on the run and cache trees. Failures are
/// logged and never abort the launch.
pub fn set_permissions(paths: &RunPaths) {
    for root in [&paths.runs, &paths.cache] {
        let mut failures = 0usize;
        for entry in WalkDir::new(root).follow_links(false) {
            let result = match entry {
                Ok(entry) if entry.file_type().is_symlink() => Ok(()),
                Ok(entry) => apply_mode(entry.path()),
                Err(err) => Err(std::io::Error::other(err.to_string())),
            };
            if let Err(err) = result {
                failures += 1;
                tracing::debug!(error = %err, "failed to set permissions");
            }
        }
        if failures > 0 {
            tracing::warn!(
                root = %root.display(),
                failures,
                "could not update permissions on every entry"
            );
        }
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(SHARED_MODE))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_separates_run_and_model_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let runs = tmp.path().join("runs");
        let cache = tmp.path().join("cache");
        let paths = create_paths("exp", "gpt2-small", &runs, &cache).unwrap();

        assert_eq!(paths.runs, runs.join("exp"));
        assert_eq!(paths.configs, cache.join("gpt2-small").join("configs"));
        assert_eq!(paths.dataset, cache.join("datasets"));
        assert_eq!(paths.preprocessed, cache.join("gpt2-small").join("preprocessed"));
        assert!(paths.tokenizer.is_dir());
        assert_eq!(paths.log_file("exp"), runs.join("exp").join("exp.log"));
        assert!(paths.log_file("exp").starts_with(&paths.runs));
    }

    #[cfg(unix)]
    #[test]
    fn permissions_are_opened_recursively() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let paths = create_paths("exp", "gpt2-small", &tmp.path().join("runs"), &tmp.path().join("cache"))
            .unwrap();
        let file = paths.preprocessed.join("train.bin");
        fs::write(&file, b"").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        set_permissions(&paths);
        let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SHARED_MODE);
    }
}
