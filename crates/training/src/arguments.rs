use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::scheduler::{compute_warmup_steps, SchedulerType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStrategy {
    No,
    #[default]
    Steps,
    Epoch,
}

/// Trainer hyperparameters under their conventional names. `output_dir`,
/// `run_name`, `seed` and `local_rank` are injected by the launcher and
/// cannot be set from a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingArguments {
    #[serde(skip_deserializing)]
    pub output_dir: PathBuf,
    #[serde(skip_deserializing)]
    pub run_name: String,
    #[serde(skip_deserializing)]
    pub seed: u64,
    #[serde(skip_deserializing, default = "default_local_rank")]
    pub local_rank: i64,

    #[serde(default = "default_true")]
    pub do_train: bool,
    #[serde(default = "default_true")]
    pub do_eval: bool,
    #[serde(default)]
    pub evaluation_strategy: EvaluationStrategy,
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub per_device_eval_batch_size: usize,
    #[serde(default = "default_one")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub adam_beta1: f64,
    #[serde(default = "default_beta2")]
    pub adam_beta2: f64,
    #[serde(default = "default_adam_epsilon")]
    pub adam_epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: f64,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default)]
    pub lr_scheduler_type: SchedulerType,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default)]
    pub warmup_ratio: f64,
    #[serde(default)]
    pub logging_first_step: bool,
    #[serde(default = "default_interval")]
    pub logging_steps: usize,
    #[serde(default = "default_interval")]
    pub save_steps: usize,
    #[serde(default)]
    pub save_total_limit: Option<usize>,
    #[serde(default)]
    pub eval_steps: Option<usize>,
    #[serde(default)]
    pub max_eval_batches: Option<usize>,
    #[serde(default)]
    pub dataloader_drop_last: bool,
    #[serde(default)]
    pub ignore_data_skip: bool,
    #[serde(default)]
    pub label_smoothing_factor: f64,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::new(),
            run_name: String::new(),
            seed: 0,
            local_rank: default_local_rank(),
            do_train: true,
            do_eval: true,
            evaluation_strategy: EvaluationStrategy::default(),
            per_device_train_batch_size: default_batch_size(),
            per_device_eval_batch_size: default_batch_size(),
            gradient_accumulation_steps: 1,
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            adam_beta1: default_beta1(),
            adam_beta2: default_beta2(),
            adam_epsilon: default_adam_epsilon(),
            max_grad_norm: default_max_grad_norm(),
            num_train_epochs: default_num_train_epochs(),
            max_steps: None,
            lr_scheduler_type: SchedulerType::default(),
            warmup_steps: 0,
            warmup_ratio: 0.0,
            logging_first_step: false,
            logging_steps: default_interval(),
            save_steps: default_interval(),
            save_total_limit: None,
            eval_steps: None,
            max_eval_batches: None,
            dataloader_drop_last: false,
            ignore_data_skip: false,
            label_smoothing_factor: 0.0,
        }
    }
}

impl TrainingArguments {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.per_device_train_batch_size == 0 {
            errors.push(
                "training_arguments.per_device_train_batch_size must be greater than 0".to_string(),
            );
        }
        if self.per_device_eval_batch_size == 0 {
            errors.push(
                "training_arguments.per_device_eval_batch_size must be greater than 0".to_string(),
            );
        }
        if self.gradient_accumulation_steps == 0 {
            errors.push(
                "training_arguments.gradient_accumulation_steps must be greater than 0".to_string(),
            );
        }
        if self.learning_rate <= 0.0 {
            errors.push("training_arguments.learning_rate must be greater than 0".to_string());
        }
        if self.weight_decay < 0.0 {
            errors.push("training_arguments.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.adam_beta1 && self.adam_beta1 < 1.0) {
            errors.push("training_arguments.adam_beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.adam_beta2 && self.adam_beta2 < 1.0) {
            errors.push("training_arguments.adam_beta2 must be in (0, 1)".to_string());
        }
        if self.adam_epsilon <= 0.0 {
            errors.push("training_arguments.adam_epsilon must be greater than 0".to_string());
        }
        if self.max_grad_norm < 0.0 {
            errors.push("training_arguments.max_grad_norm must be >= 0".to_string());
        }
        if self.max_steps.is_none() && self.num_train_epochs <= 0.0 {
            errors.push(
                "training_arguments.num_train_epochs must be greater than 0 when max_steps is unset"
                    .to_string(),
            );
        }
        if let Some(0) = self.max_steps {
            errors.push("training_arguments.max_steps must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            errors.push("training_arguments.warmup_ratio must be in [0, 1]".to_string());
        }
        if !(0.0..1.0).contains(&self.label_smoothing_factor) {
            errors.push("training_arguments.label_smoothing_factor must be in [0, 1)".to_string());
        }
        if self.logging_steps == 0 {
            errors.push("training_arguments.logging_steps must be greater than 0".to_string());
        }
        if self.save_steps == 0 {
            errors.push("training_arguments.save_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.save_total_limit {
            errors.push("training_arguments.save_total_limit must be greater than 0".to_string());
        }
        if let Some(0) = self.eval_steps {
            errors.push("training_arguments.eval_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.max_eval_batches {
            errors.push("training_arguments.max_eval_batches must be greater than 0".to_string());
        }
        if self.do_eval && self.evaluation_strategy == EvaluationStrategy::No && self.eval_steps.is_some() {
            errors.push(
                "training_arguments.eval_steps is set but evaluation_strategy is `no`".to_string(),
            );
        }
    }

    pub fn eval_interval(&self) -> usize {
        self.eval_steps.unwrap_or(self.logging_steps)
    }

    pub fn evaluates(&self) -> bool {
        self.do_eval && self.evaluation_strategy != EvaluationStrategy::No
    }

    pub fn warmup_for(&self, total_steps: usize) -> usize {
        compute_warmup_steps(total_steps, self.warmup_steps, self.warmup_ratio)
    }

    pub fn should_log(&self, global_step: usize) -> bool {
        (self.logging_first_step && global_step == 1) || global_step % self.logging_steps == 0
    }

    pub fn should_save(&self, global_step: usize) -> bool {
        global_step % self.save_steps == 0
    }

    pub fn should_evaluate_step(&self, global_step: usize) -> bool {
        self.evaluates()
            && self.evaluation_strategy == EvaluationStrategy::Steps
            && global_step % self.eval_interval() == 0
    }

    /// Primary process in a launch: rank -1 (single process) or 0.
    pub fn is_primary(&self) -> bool {
        self.local_rank <= 0
    }
}

fn default_local_rank() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_batch_size() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    5e-5
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_epsilon() -> f64 {
    1e-8
}

fn default_max_grad_norm() -> f64 {
    1.0
}

fn default_num_train_epochs() -> f64 {
    3.0
}

fn default_interval() -> usize {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_trainer_conventions() {
        let args: TrainingArguments = serde_json::from_str("{}").unwrap();
        assert_eq!(args.learning_rate, 5e-5);
        assert_eq!(args.adam_beta2, 0.999);
        assert_eq!(args.lr_scheduler_type, SchedulerType::Linear);
        assert_eq!(args.eval_interval(), 500);
        assert_eq!(args.local_rank, -1);
        assert!(args.evaluates());
    }

    #[test]
    fn launcher_injected_fields_are_not_configurable() {
        let parsed: Result<TrainingArguments, _> =
            serde_json::from_str(r#"{"output_dir": "/tmp/elsewhere"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn schedule_predicates() {
        let args = TrainingArguments {
            logging_steps: 10,
            logging_first_step: true,
            save_steps: 4,
            eval_steps: Some(6),
            ..TrainingArguments::default()
        };
        assert!(args.should_log(1));
        assert!(!args.should_log(2));
        assert!(args.should_log(20));
        assert!(args.should_save(8));
        assert!(args.should_evaluate_step(12));
        assert!(!args.should_evaluate_step(10));
    }

    #[test]
    fn invalid_values_are_collected() {
        let args = TrainingArguments {
            per_device_train_batch_size: 0,
            adam_beta1: 1.0,
            warmup_ratio: 2.0,
            ..TrainingArguments::default()
        };
        let mut errors = Vec::new();
        args.validate(&mut errors);
        assert_eq!(errors.len(), 3, "{errors:?}");
    }
}
