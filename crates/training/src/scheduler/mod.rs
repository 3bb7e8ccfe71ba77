use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Final learning rate reached by the polynomial schedule.
pub const POLYNOMIAL_LR_END: f64 = 1e-7;

pub trait LRScheduler: Send {
    /// Returns the learning rate for the upcoming optimizer step and advances.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    #[default]
    Linear,
    Cosine,
    Constant,
    ConstantWithWarmup,
    Polynomial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: SchedulerType,
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub step: usize,
    pub last_lr: f64,
}

/// Multiplies the base rate by a per-step factor, the way a lambda schedule does.
pub struct LambdaSchedule {
    kind: SchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl LambdaSchedule {
    pub fn new(
        kind: SchedulerType,
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if kind == SchedulerType::Polynomial && base_lr <= POLYNOMIAL_LR_END {
            return Err(TrainingError::initialization(format!(
                "polynomial schedule needs a learning rate above its end value {POLYNOMIAL_LR_END}"
            )));
        }
        let mut schedule = Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
            current_lr: 0.0,
        };
        schedule.current_lr = base_lr * schedule.factor(0);
        Ok(schedule)
    }

    pub fn factor(&self, step: usize) -> f64 {
        let warmup = self.warmup_steps;
        let in_warmup = step < warmup;
        let warmup_factor = step as f64 / warmup.max(1) as f64;

        match self.kind {
            SchedulerType::Constant => 1.0,
            SchedulerType::ConstantWithWarmup => {
                if in_warmup {
                    warmup_factor
                } else {
                    1.0
                }
            }
            SchedulerType::Linear => {
                if in_warmup {
                    return warmup_factor;
                }
                let remaining = self.total_steps.saturating_sub(step) as f64;
                let span = self.total_steps.saturating_sub(warmup).max(1) as f64;
                (remaining / span).max(0.0)
            }
            SchedulerType::Cosine => {
                if in_warmup {
                    return warmup_factor;
                }
                let span = self.total_steps.saturating_sub(warmup).max(1) as f64;
                let progress = (step - warmup) as f64 / span;
                (0.5 * (1.0 + f64::cos(PI * progress))).max(0.0)
            }
            SchedulerType::Polynomial => {
                if in_warmup {
                    return warmup_factor;
                }
                if step > self.total_steps {
                    return POLYNOMIAL_LR_END / self.base_lr;
                }
                let range = self.base_lr - POLYNOMIAL_LR_END;
                let span = self.total_steps.saturating_sub(warmup).max(1) as f64;
                let remaining = 1.0 - (step - warmup) as f64 / span;
                (range * remaining + POLYNOMIAL_LR_END) / self.base_lr
            }
        }
    }
}

impl LRScheduler for LambdaSchedule {
    fn step(&mut self) -> f64 {
        let lr = self.base_lr * self.factor(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: self.kind,
            base_lr: self.base_lr,
            warmup_steps: self.warmup_steps,
            total_steps: self.total_steps,
            step: self.step,
            last_lr: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.kind != self.kind {
            return Err(TrainingError::checkpoint(format!(
                "checkpoint scheduler is {:?} but the run is configured for {:?}",
                state.kind, self.kind
            )));
        }
        if state.total_steps != self.total_steps || state.warmup_steps != self.warmup_steps {
            tracing::warn!(
                saved_total = state.total_steps,
                total = self.total_steps,
                saved_warmup = state.warmup_steps,
                warmup = self.warmup_steps,
                "scheduler horizon changed since checkpoint; continuing with the configured one"
            );
        }
        self.step = state.step;
        self.current_lr = state.last_lr;
        Ok(())
    }
}

/// Warmup length: explicit steps win over a ratio of the total.
pub fn compute_warmup_steps(total_steps: usize, warmup_steps: usize, warmup_ratio: f64) -> usize {
    if warmup_steps > 0 {
        return warmup_steps;
    }
    (warmup_ratio.clamp(0.0, 1.0) * total_steps as f64).ceil() as usize
}

pub fn build(
    kind: SchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
) -> Result<Box<dyn LRScheduler>, TrainingError> {
    Ok(Box::new(LambdaSchedule::new(
        kind,
        base_lr,
        warmup_steps,
        total_steps,
    )?))
}
