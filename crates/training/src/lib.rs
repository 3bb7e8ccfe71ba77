//! Training side of the launcher: configuration, the trainer loop,
//! checkpoints and experiment tracking.

pub mod arguments;
pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod launch;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod overrides;
pub mod overwatch;
pub mod paths;
pub mod scheduler;
pub mod seed;
pub mod state;
pub mod tensorboard;
pub mod trainer;

pub use arguments::{EvaluationStrategy, TrainingArguments};
pub use callbacks::{resume_tracking_id, ExperimentTrackingCallback, TrackingSettings, TrainerCallback};
pub use checkpoint::{get_last_checkpoint, load_checkpoint, save_checkpoint, LoadedCheckpoint};
pub use config::{LaunchConfig, TrainingError};
pub use loss::{CausalLmLoss, LossMetrics, LossOutput};
pub use optimizer::{AdamWConfig, OptimizerState, TrainerOptimizer};
pub use overrides::ConfigOverride;
pub use paths::{create_paths, resolve_run_id, set_permissions, RunPaths};
pub use scheduler::{LRScheduler, SchedulerType};
pub use seed::seed_everything;
pub use state::{Logs, TrainerState};
pub use trainer::{select_device, TrainOutput, Trainer};
