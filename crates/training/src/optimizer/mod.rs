use std::collections::HashMap;
use std::path::Path;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{arguments::TrainingArguments, TrainingError};

const EPS: f64 = 1e-12;

/// Parameter name fragments excluded from weight decay: biases and layer norms.
pub const NO_DECAY_PATTERNS: &[&str] = &["bias", "ln_"];

pub const OPTIMIZER_STATE_FILE: &str = "optimizer.json";
pub const OPTIMIZER_MOMENTS_FILE: &str = "optimizer.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&TrainingArguments> for AdamWConfig {
    fn from(args: &TrainingArguments) -> Self {
        Self {
            learning_rate: args.learning_rate,
            beta1: args.adam_beta1,
            beta2: args.adam_beta2,
            epsilon: args.adam_epsilon,
            weight_decay: args.weight_decay,
        }
    }
}

/// AdamW with decoupled weight decay over `f32` parameters.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        no_decay: &[&str],
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let second_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let apply_weight_decay = should_apply_weight_decay(&name, no_decay);

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        let decayed = params.iter().filter(|slot| slot.apply_weight_decay).count();
        tracing::debug!(
            parameters = params.len(),
            decayed,
            "optimizer parameter groups"
        );

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for slot in &mut self.params {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - cfg.beta1, 0.0)?))
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?))
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = slot.param.as_tensor();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base.clone()
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn save_state(&self, dir: &Path) -> Result<(), TrainingError> {
        let mut moments = HashMap::with_capacity(self.params.len() * 2);
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            moments.insert(format!("{}.exp_avg", slot.name), slot.first_moment.clone());
            moments.insert(
                format!("{}.exp_avg_sq", slot.name),
                slot.second_moment.clone(),
            );
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                weight_decay: slot.apply_weight_decay,
            });
        }
        candle_core::safetensors::save(&moments, dir.join(OPTIMIZER_MOMENTS_FILE))
            .map_err(to_runtime_error)?;

        let state = OptimizerState {
            step: self.step,
            config: self.config,
            parameters,
        };
        let data = serde_json::to_vec_pretty(&state).map_err(|err| {
            TrainingError::checkpoint(format!("failed to serialize optimizer state: {err}"))
        })?;
        std::fs::write(dir.join(OPTIMIZER_STATE_FILE), data)?;
        Ok(())
    }

    pub fn load_state(&mut self, dir: &Path) -> Result<(), TrainingError> {
        let data = std::fs::read(dir.join(OPTIMIZER_STATE_FILE))?;
        let state: OptimizerState = serde_json::from_slice(&data).map_err(|err| {
            TrainingError::checkpoint(format!("failed to parse optimizer state: {err}"))
        })?;

        let Some(first) = self.params.first() else {
            return Ok(());
        };
        let device = first.param.as_tensor().device().clone();
        let mut moments = candle_core::safetensors::load(dir.join(OPTIMIZER_MOMENTS_FILE), &device)
            .map_err(to_runtime_error)?;

        let shapes: HashMap<_, _> = state
            .parameters
            .iter()
            .map(|param| (param.name.as_str(), param.shape.as_slice()))
            .collect();
        if shapes.len() != self.params.len() {
            return Err(TrainingError::checkpoint(format!(
                "optimizer state tracks {} parameters but the model has {}",
                shapes.len(),
                self.params.len()
            )));
        }

        for slot in &mut self.params {
            let dims = slot.param.as_tensor().dims();
            match shapes.get(slot.name.as_str()) {
                Some(shape) if *shape == dims => {}
                Some(_) => {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state shape mismatch for '{}'",
                        slot.name
                    )))
                }
                None => {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state missing parameter '{}'",
                        slot.name
                    )))
                }
            }
            let mut take = |suffix: &str| {
                let key = format!("{}.{suffix}", slot.name);
                moments.remove(&key).ok_or_else(|| {
                    TrainingError::checkpoint(format!("optimizer moments missing '{key}'"))
                })
            };
            let first_moment = take("exp_avg")?;
            let second_moment = take("exp_avg_sq")?;
            if first_moment.dims() != dims || second_moment.dims() != dims {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer moment shape mismatch for '{}'",
                    slot.name
                )));
            }
            slot.first_moment = first_moment;
            slot.second_moment = second_moment;
        }

        self.step = state.step;
        self.config.learning_rate = state.config.learning_rate;
        Ok(())
    }
}

fn should_apply_weight_decay(name: &str, exclusions: &[&str]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern))
}

/// Global L2 norm over the gradients of `params`.
pub fn global_grad_norm(grads: &GradStore, params: &[Tensor]) -> Result<f64, TrainingError> {
    let mut sum_squares = 0.0f64;
    for tensor in params {
        if let Some(grad) = grads.get(tensor) {
            sum_squares += grad
                .sqr()
                .and_then(|sq| sq.sum_all())
                .and_then(|sq| sq.to_vec0::<f32>())
                .map_err(to_runtime_error)? as f64;
        }
    }
    Ok(sum_squares.sqrt())
}

/// Rescales gradients so their global norm is at most `max_norm`; returns the
/// norm measured before clipping.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    params: &[Tensor],
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let total_norm = global_grad_norm(grads, params)?;
    if max_norm > 0.0 && total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for tensor in params {
            if let Some(grad) = grads.remove(tensor) {
                let clipped = (grad * clip_coef).map_err(to_runtime_error)?;
                grads.insert(tensor, clipped);
            }
        }
    }
    Ok(total_norm)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub config: AdamWConfig,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub weight_decay: bool,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
