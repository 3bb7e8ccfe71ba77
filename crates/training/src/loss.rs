use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Next-token cross entropy: position `t` of the logits is scored against
/// token `t + 1` of the input.
#[derive(Debug, Clone, Default)]
pub struct CausalLmLoss {
    label_smoothing: f32,
}

impl CausalLmLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    /// `logits` is `(batch, seq, vocab)`, `input_ids` is `(batch, seq)`.
    pub fn compute(&self, logits: &Tensor, input_ids: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, seq_len, vocab_size) = logits.dims3().map_err(to_runtime_error)?;
        if input_ids.dims() != [batch, seq_len].as_slice() {
            return Err(TrainingError::runtime(
                "input ids must match logits batch/sequence dimensions",
            ));
        }
        if seq_len < 2 {
            return Err(TrainingError::runtime(
                "next-token loss needs sequences of at least two tokens",
            ));
        }
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_count = batch * (seq_len - 1);
        let logits_flat = logits
            .narrow(1, 0, seq_len - 1)
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((token_count, vocab_size)))
            .map_err(to_runtime_error)?;
        let targets = input_ids
            .to_device(logits.device())
            .and_then(|t| t.narrow(1, 1, seq_len - 1))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((token_count,)))
            .map_err(to_runtime_error)?;
        let targets = match targets.dtype() {
            DType::U32 => targets,
            DType::I64 | DType::U8 => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let per_token_loss = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs
                .mean(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let smoothed = nll.affine(1.0 - smoothing, 0.0).map_err(to_runtime_error)?;
            let uniform_term = uniform.affine(smoothing, 0.0).map_err(to_runtime_error)?;
            (smoothed + uniform_term).map_err(to_runtime_error)?
        } else {
            nll
        };

        let loss = per_token_loss.mean_all().map_err(to_runtime_error)?;
        let average_loss = loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        let correct_tokens = logits_flat
            .argmax(D::Minus1)
            .and_then(|predictions| predictions.eq(&targets))
            .and_then(|hits| hits.to_dtype(DType::F32))
            .and_then(|hits| hits.sum_all())
            .and_then(|hits| hits.to_vec0::<f32>())
            .map_err(to_runtime_error)?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_tokens: token_count,
                correct_tokens,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
