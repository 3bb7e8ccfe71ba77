use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use model::Gpt2Overrides;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::arguments::TrainingArguments;
use crate::overrides::{merge_values, ConfigOverride};

/// Key listing parent configuration files, relative to the file that names them.
pub const INHERIT_KEY: &str = "inherit";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub infra: InfraConfig,
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub training_arguments: TrainingArguments,
    #[serde(default, alias = "wandb")]
    pub tracking: TrackingConfig,
}

impl LaunchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::load_with_overrides(path, &[])
    }

    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        overrides: &[ConfigOverride],
    ) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let mut tree = read_tree(path, &mut Vec::new())?;
        for override_arg in overrides {
            override_arg.apply(&mut tree)?;
        }

        let mut config: LaunchConfig = serde_json::from_value(tree)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.infra.nodes == 0 {
            errors.push("infra.nodes must be greater than 0".to_string());
        }
        if self.infra.gpus == 0 {
            errors.push("infra.gpus must be greater than 0".to_string());
        }
        if self.infra.rank < -1 {
            errors.push("infra.rank must be -1 or a process index".to_string());
        }

        if model::lookup(&self.model.id).is_none() {
            errors.push(format!(
                "model.id '{}' is not registered (expected one of: {})",
                self.model.id,
                model::registry::known_ids().join(", ")
            ));
        }
        if self.model.seq_len == 0 {
            errors.push("model.seq_len must be greater than 0".to_string());
        }
        if let Some(path) = &self.model.tokenizer_file {
            if !path.is_file() {
                errors.push(format!(
                    "model.tokenizer_file ({}) does not exist",
                    path.display()
                ));
            }
        }

        match &self.dataset.files {
            Some(files) => {
                if files.train.is_empty() {
                    errors.push("dataset.files.train must not be empty".to_string());
                }
                let validation = files.validation.iter().flatten();
                for shard in files.train.iter().chain(validation) {
                    if !shard.is_file() {
                        errors.push(format!(
                            "dataset.files entry ({}) does not exist",
                            shard.display()
                        ));
                    }
                }
            }
            None => {
                if corpora::lookup(&self.dataset.id).is_err() {
                    errors.push(format!(
                        "dataset.id '{}' is not registered (expected one of: {})",
                        self.dataset.id,
                        corpora::registry::known_ids().join(", ")
                    ));
                }
            }
        }
        if !(0.0..1.0).contains(&self.dataset.validation_ratio) {
            errors.push("dataset.validation_ratio must be in [0, 1)".to_string());
        }
        if self.dataset.num_proc == 0 {
            errors.push("dataset.num_proc must be greater than 0".to_string());
        }

        if self.tracking.flush_every == 0 {
            errors.push("tracking.flush_every must be greater than 0".to_string());
        }

        self.training_arguments.validate(&mut errors);

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Primary process in a launch: rank -1 (single process) or 0.
    pub fn is_primary(&self) -> bool {
        self.infra.rank <= 0
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.artifacts.cache_dir, base);
        absolutize_in_place(&mut self.artifacts.run_dir, base);
        if let Some(path) = self.model.tokenizer_file.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(files) = self.dataset.files.as_mut() {
            for shard in &mut files.train {
                absolutize_in_place(shard, base);
            }
            for shard in files.validation.iter_mut().flatten() {
                absolutize_in_place(shard, base);
            }
        }
    }
}

/// Reads `path` into a JSON tree with every parent named under `inherit`
/// merged beneath it.
fn read_tree(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Value, TrainingError> {
    let canonical = fs::canonicalize(path)?;
    if chain.contains(&canonical) {
        return Err(TrainingError::ConfigFormat(format!(
            "configuration inheritance cycle through {}",
            path.display()
        )));
    }
    chain.push(canonical);

    let contents = fs::read_to_string(path)?;
    let mut tree: Value = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
        Some("json") => serde_json::from_str(&contents)?,
        Some("toml") | Some("tml") => toml::from_str(&contents)?,
        Some(other) => {
            return Err(TrainingError::ConfigFormat(format!(
                "unsupported configuration extension '{}'",
                other
            )));
        }
        None => {
            return Err(TrainingError::ConfigFormat(format!(
                "configuration file {} has no extension",
                path.display()
            )));
        }
    };
    if tree.is_null() {
        tree = Value::Object(serde_json::Map::new());
    }
    let Value::Object(map) = &mut tree else {
        return Err(TrainingError::ConfigFormat(format!(
            "{} must contain a mapping at the top level",
            path.display()
        )));
    };

    let parents = match map.remove(INHERIT_KEY) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(parent)) => vec![parent],
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(parent) => Ok(parent),
                other => Err(TrainingError::ConfigFormat(format!(
                    "`{INHERIT_KEY}` entries must be paths, got {other}"
                ))),
            })
            .collect::<Result<_, _>>()?,
        Some(other) => {
            return Err(TrainingError::ConfigFormat(format!(
                "`{INHERIT_KEY}` must be a path or a list of paths, got {other}"
            )))
        }
    };

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut merged = Value::Object(serde_json::Map::new());
    for parent in parents {
        let parent_tree = read_tree(&base_dir.join(parent), chain)?;
        merge_values(&mut merged, parent_tree);
    }
    merge_values(&mut merged, tree);

    chain.pop();
    Ok(merged)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfraConfig {
    #[serde(default = "default_one")]
    pub nodes: usize,
    #[serde(default = "default_one")]
    pub gpus: usize,
    #[serde(default = "default_rank")]
    pub rank: i64,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            nodes: 1,
            gpus: 1,
            rank: default_rank(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub pretrained_tokenizer: bool,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    #[serde(default)]
    pub tokenizer_file: Option<PathBuf>,
    #[serde(default)]
    pub overrides: Gpt2Overrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_validation_ratio")]
    pub validation_ratio: f64,
    #[serde(default = "default_one")]
    pub num_proc: usize,
    #[serde(default)]
    pub files: Option<DatasetFiles>,
}

/// Local text shards (one document per line) used in place of a hub download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetFiles {
    pub train: Vec<PathBuf>,
    #[serde(default)]
    pub validation: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactsConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            run_dir: default_run_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfig {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_one")]
    pub flush_every: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            project: None,
            group: None,
            entity: None,
            tensorboard: true,
            flush_every: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "LogLevelRepr")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_tracing(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogLevelRepr {
    Number(u64),
    Name(String),
}

impl TryFrom<LogLevelRepr> for LogLevel {
    type Error = String;

    fn try_from(value: LogLevelRepr) -> Result<Self, String> {
        match value {
            LogLevelRepr::Number(10) => Ok(LogLevel::Debug),
            LogLevelRepr::Number(20) => Ok(LogLevel::Info),
            LogLevelRepr::Number(30) => Ok(LogLevel::Warning),
            LogLevelRepr::Number(40) => Ok(LogLevel::Error),
            LogLevelRepr::Number(50) => Ok(LogLevel::Critical),
            LogLevelRepr::Number(other) => Err(format!("unknown numeric log level {other}")),
            LogLevelRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "debug" => Ok(LogLevel::Debug),
                "info" => Ok(LogLevel::Info),
                "warn" | "warning" => Ok(LogLevel::Warning),
                "error" => Ok(LogLevel::Error),
                "critical" | "fatal" => Ok(LogLevel::Critical),
                other => Err(format!("unknown log level '{other}'")),
            },
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_seed() -> u64 {
    21
}

fn default_one() -> usize {
    1
}

fn default_rank() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

fn default_seq_len() -> usize {
    1024
}

fn default_validation_ratio() -> f64 {
    0.0005
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("runs")
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Checkpoint(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "io error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_)
            | TrainingError::Runtime(_)
            | TrainingError::Checkpoint(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_yaml::Error> for TrainingError {
    fn from(value: serde_yaml::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
