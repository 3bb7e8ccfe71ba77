use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named scalar metrics emitted by one log, evaluation or summary event.
pub type Logs = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub step: usize,
    pub epoch: f64,
    #[serde(flatten)]
    pub values: Logs,
}

/// Progress of a training run, persisted as `trainer_state.json` in every
/// checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    /// Fractional epoch: `epoch_index + batches_done / batches_per_epoch`.
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub num_update_steps_per_epoch: usize,
    pub train_batch_size: usize,
    pub total_samples: usize,
    pub log_history: Vec<LogRecord>,
    pub is_world_process_zero: bool,
}

impl TrainerState {
    /// Appends to `log_history`. Non-finite values are dropped since JSON
    /// cannot carry them.
    pub fn record(&mut self, mut values: Logs) -> LogRecord {
        values.retain(|_, value| value.is_finite());
        let record = LogRecord {
            step: self.global_step,
            epoch: round_epoch(self.epoch),
            values,
        };
        self.log_history.push(record.clone());
        record
    }
}

/// Epochs are reported with two decimals.
pub fn round_epoch(epoch: f64) -> f64 {
    (epoch * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_flat() {
        let mut state = TrainerState {
            global_step: 10,
            epoch: 0.3333,
            ..TrainerState::default()
        };
        let record = state.record(Logs::from([("loss".to_string(), 2.5)]));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"step": 10, "epoch": 0.33, "loss": 2.5}));

        let parsed: LogRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(state.log_history.len(), 1);
    }
}
