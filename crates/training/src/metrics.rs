use std::time::{Duration, Instant};

use crate::state::Logs;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }
}

/// Per optimizer-step bookkeeping between two `logging_steps` events.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    tokens_processed: u64,
    loss_since_log: f64,
    steps_since_log: usize,
    loss_total: f64,
    steps_total: usize,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            tokens_processed: 0,
            loss_since_log: 0.0,
            steps_since_log: 0,
            loss_total: 0.0,
            steps_total: 0,
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    /// `loss` is the mean micro-batch loss of one optimizer step.
    pub fn record_step(&mut self, tokens: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.tokens_processed = self.tokens_processed.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let tokens_per_sec = self.throughput_ema.update(step_tokens_per_sec);

        self.loss_since_log += loss;
        self.steps_since_log += 1;
        self.loss_total += loss;
        self.steps_total += 1;

        StepSnapshot {
            step_loss: loss,
            tokens,
            tokens_per_sec,
            grad_norm,
            total_tokens: self.tokens_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }

    /// Mean loss over the steps since the previous call; resets the window.
    pub fn take_logging_loss(&mut self) -> Option<f64> {
        if self.steps_since_log == 0 {
            return None;
        }
        let mean = self.loss_since_log / self.steps_since_log as f64;
        self.loss_since_log = 0.0;
        self.steps_since_log = 0;
        Some(mean)
    }

    /// Mean loss over every step recorded by this process.
    pub fn train_loss(&self) -> f64 {
        if self.steps_total == 0 {
            0.0
        } else {
            self.loss_total / self.steps_total as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub step_loss: f64,
    pub tokens: u64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    token_count: u64,
    correct_tokens: u64,
    samples: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, tokens: u64, correct: u64, samples: usize) {
        self.loss_sum += loss * tokens as f64;
        self.token_count += tokens;
        self.correct_tokens += correct;
        self.samples += samples;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.token_count == 0 {
            None
        } else {
            let avg_loss = self.loss_sum / self.token_count as f64;
            Some(EvaluationSummary {
                average_loss: avg_loss,
                perplexity: perplexity(avg_loss),
                accuracy: (self.correct_tokens as f64) / (self.token_count as f64),
                tokens: self.token_count,
                samples: self.samples,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub perplexity: f64,
    pub accuracy: f64,
    pub tokens: u64,
    pub samples: usize,
}

impl EvaluationSummary {
    pub fn to_logs(&self, runtime: Duration) -> Logs {
        let mut logs = Logs::new();
        logs.insert("eval_loss".into(), self.average_loss);
        logs.insert("eval_perplexity".into(), self.perplexity);
        logs.insert("eval_accuracy".into(), self.accuracy);
        logs.extend(speed_metrics("eval", runtime, self.samples, None));
        logs
    }
}

/// `exp(loss)`, saturating to infinity instead of overflowing.
pub fn perplexity(loss: f64) -> f64 {
    if loss > 709.0 {
        f64::INFINITY
    } else {
        loss.exp()
    }
}

/// `{prefix}_runtime`, `{prefix}_samples_per_second` and optionally
/// `{prefix}_steps_per_second`.
pub fn speed_metrics(prefix: &str, runtime: Duration, samples: usize, steps: Option<usize>) -> Logs {
    let seconds = runtime.as_secs_f64();
    let mut logs = Logs::new();
    logs.insert(format!("{prefix}_runtime"), round4(seconds));
    let per_second = |count: usize| {
        if seconds > 0.0 {
            round3(count as f64 / seconds)
        } else {
            0.0
        }
    };
    logs.insert(format!("{prefix}_samples_per_second"), per_second(samples));
    if let Some(steps) = steps {
        logs.insert(format!("{prefix}_steps_per_second"), per_second(steps));
    }
    logs
}

fn round3(value: f64) -> f64 {
    (value * 1_000.0).round() / 1_000.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
