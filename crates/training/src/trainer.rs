use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use candle_core::{
    backprop::GradStore,
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};
use corpora::LmDataset;
use model::Gpt2LmHeadModel;
use rand::seq::SliceRandom;
use tokenizers::Tokenizer;

use crate::{
    arguments::{EvaluationStrategy, TrainingArguments},
    callbacks::TrainerCallback,
    checkpoint::{self, RngState, SaveRequest},
    loss::{CausalLmLoss, LossMetrics, LossOutput},
    metrics::{speed_metrics, EvaluationMetrics, TrainingMetrics},
    optimizer::{clip_grad_norm, AdamWConfig, TrainerOptimizer, NO_DECAY_PATTERNS},
    scheduler::{self, LRScheduler},
    seed::epoch_rng,
    state::{Logs, TrainerState},
    TrainingError,
};

pub const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Picks Metal, then CUDA, then the CPU.
pub fn select_device() -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    tracing::debug!(cuda_available, metal_available, "device detection");

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("using Metal GPU #0");
                return device;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to initialize metal device, falling back to CPU")
            }
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                tracing::info!("using CUDA GPU #0");
                return device;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cuda reported available but initialization failed")
            }
        }
    } else {
        tracing::info!("no GPU backend available; using CPU");
    }
    Device::Cpu
}

/// Result of [`Trainer::train`].
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: usize,
    pub training_loss: f64,
    pub metrics: Logs,
}

pub struct Trainer {
    model: Gpt2LmHeadModel,
    args: TrainingArguments,
    train_dataset: LmDataset,
    eval_dataset: Option<LmDataset>,
    tokenizer: Option<Tokenizer>,
    callbacks: Vec<Box<dyn TrainerCallback>>,
    loss: CausalLmLoss,
    parameter_tensors: Vec<Tensor>,
    state: TrainerState,
    stop: Arc<AtomicBool>,
    last_saved_step: Option<usize>,
}

impl Trainer {
    pub fn new(
        model: Gpt2LmHeadModel,
        mut args: TrainingArguments,
        train_dataset: LmDataset,
        eval_dataset: Option<LmDataset>,
        tokenizer: Option<Tokenizer>,
        callbacks: Vec<Box<dyn TrainerCallback>>,
    ) -> Result<Self, TrainingError> {
        let mut errors = Vec::new();
        args.validate(&mut errors);
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        if train_dataset.is_empty() {
            return Err(TrainingError::initialization("training dataset is empty"));
        }
        let eval_dataset = eval_dataset.filter(|dataset| !dataset.is_empty());
        if args.evaluates() && eval_dataset.is_none() {
            tracing::warn!("evaluation requested but no validation blocks are available; disabling evaluation");
            args.do_eval = false;
        }

        let parameter_tensors = model
            .named_parameters()
            .map_err(to_runtime_error)?
            .into_iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();
        let loss = CausalLmLoss::new().with_label_smoothing(args.label_smoothing_factor as f32)?;
        let state = TrainerState {
            train_batch_size: args.per_device_train_batch_size,
            is_world_process_zero: args.is_primary(),
            ..TrainerState::default()
        };

        Ok(Self {
            model,
            args,
            train_dataset,
            eval_dataset,
            tokenizer,
            callbacks,
            loss,
            parameter_tensors,
            state,
            stop: Arc::new(AtomicBool::new(false)),
            last_saved_step: None,
        })
    }

    pub fn args(&self) -> &TrainingArguments {
        &self.args
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn model(&self) -> &Gpt2LmHeadModel {
        &self.model
    }

    /// Setting the flag ends training after the current optimizer step and
    /// writes a checkpoint.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn set_stop_flag(&mut self, stop: Arc<AtomicBool>) {
        self.stop = stop;
    }

    fn batches_per_epoch(&self) -> usize {
        let samples = self.train_dataset.len();
        let batch_size = self.args.per_device_train_batch_size;
        if self.args.dataloader_drop_last {
            samples / batch_size
        } else {
            samples.div_ceil(batch_size)
        }
    }

    pub fn train(&mut self, resume_from_checkpoint: Option<&Path>) -> Result<TrainOutput, TrainingError> {
        let batches_per_epoch = self.batches_per_epoch();
        if batches_per_epoch == 0 {
            return Err(TrainingError::initialization(format!(
                "{} training blocks cannot fill a batch of {}",
                self.train_dataset.len(),
                self.args.per_device_train_batch_size
            )));
        }
        let accumulation = self.args.gradient_accumulation_steps;
        let updates_per_epoch = (batches_per_epoch / accumulation).max(1);
        let max_steps = match self.args.max_steps {
            Some(steps) => steps,
            None => (self.args.num_train_epochs * updates_per_epoch as f64).ceil() as usize,
        };
        let num_train_epochs = max_steps.div_ceil(updates_per_epoch);

        let mut optimizer = TrainerOptimizer::new(
            self.model.named_parameters().map_err(to_runtime_error)?,
            AdamWConfig::from(&self.args),
            NO_DECAY_PATTERNS,
        )?;
        let warmup_steps = self.args.warmup_for(max_steps);
        let mut scheduler = scheduler::build(
            self.args.lr_scheduler_type,
            self.args.learning_rate,
            warmup_steps,
            max_steps,
        )?;

        if let Some(dir) = resume_from_checkpoint {
            self.restore(dir, &mut optimizer, &mut *scheduler)?;
        }
        self.state.max_steps = max_steps;
        self.state.num_train_epochs = num_train_epochs;
        self.state.num_update_steps_per_epoch = updates_per_epoch;
        self.state.train_batch_size = self.args.per_device_train_batch_size;
        self.state.is_world_process_zero = self.args.is_primary();

        let epochs_trained = self.state.global_step / updates_per_epoch;
        let mut batches_to_skip = if self.args.ignore_data_skip {
            0
        } else {
            (self.state.global_step % updates_per_epoch) * accumulation
        };

        tracing::info!(
            num_examples = self.train_dataset.len(),
            num_epochs = num_train_epochs,
            batch_size = self.args.per_device_train_batch_size,
            gradient_accumulation_steps = accumulation,
            total_optimization_steps = max_steps,
            warmup_steps,
            parameters = self.parameter_tensors.iter().map(|t| t.elem_count()).sum::<usize>(),
            "***** Running training *****"
        );
        if self.state.global_step > 0 {
            tracing::info!(
                global_step = self.state.global_step,
                epochs_trained,
                batches_to_skip,
                "continuing training from checkpoint"
            );
        }

        for callback in self.callbacks.iter_mut() {
            callback.on_train_begin(&self.args, &self.state)?;
        }

        let start = Instant::now();
        let start_step = self.state.global_step;
        let mut metrics = TrainingMetrics::new();
        let mut samples_seen = 0usize;
        let mut stopped = false;

        'epochs: for epoch in epochs_trained..num_train_epochs {
            if self.state.global_step >= max_steps {
                break;
            }
            let mut order: Vec<usize> = (0..self.train_dataset.len()).collect();
            order.shuffle(&mut epoch_rng(self.args.seed, epoch));
            let batches: Vec<&[usize]> = order
                .chunks(self.args.per_device_train_batch_size)
                .take(batches_per_epoch)
                .collect();

            let mut accumulated: Option<GradStore> = None;
            let mut window = StepWindow::default();

            for (batch_index, indices) in batches.iter().enumerate() {
                if batches_to_skip > 0 {
                    batches_to_skip -= 1;
                    continue;
                }

                let input_ids = self.batch_tensor(&self.train_dataset, indices)?;
                let logits = self
                    .model
                    .forward(&input_ids, true)
                    .map_err(to_runtime_error)?;
                let LossOutput { loss, metrics: batch_metrics } =
                    self.loss.compute(&logits, &input_ids)?;
                window.accumulate(&batch_metrics);
                samples_seen += indices.len();
                self.state.total_samples += indices.len();

                let micro_grads = loss
                    .affine(1.0 / accumulation as f64, 0.0)
                    .and_then(|scaled| scaled.backward())
                    .map_err(to_runtime_error)?;
                match accumulated.as_mut() {
                    Some(existing) => self.merge_gradient_store(existing, micro_grads)?,
                    None => accumulated = Some(micro_grads),
                }

                let is_last = batch_index + 1 == batches.len();
                let at_boundary = (batch_index + 1) % accumulation == 0
                    || (batches.len() < accumulation && is_last);
                if !at_boundary {
                    continue;
                }
                let Some(mut grads) = accumulated.take() else {
                    continue;
                };

                let grad_norm = clip_grad_norm(&mut grads, &self.parameter_tensors, self.args.max_grad_norm)?;
                let lr = scheduler.step();
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;

                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + (batch_index + 1) as f64 / batches.len() as f64;

                let step_loss = window.take_mean_loss();
                let snapshot = metrics.record_step(window.take_tokens() as u64, step_loss, grad_norm);
                tracing::debug!(
                    step = self.state.global_step,
                    loss = snapshot.step_loss,
                    grad_norm = snapshot.grad_norm,
                    tokens_per_sec = snapshot.tokens_per_sec,
                    lr,
                    "optimizer step"
                );

                if self.args.should_log(self.state.global_step) {
                    let mut logs = Logs::new();
                    if let Some(loss) = metrics.take_logging_loss() {
                        logs.insert("loss".into(), loss);
                    }
                    logs.insert("learning_rate".into(), lr);
                    logs.insert("grad_norm".into(), grad_norm);
                    self.log(logs)?;
                }
                if self.args.should_evaluate_step(self.state.global_step) {
                    self.evaluate()?;
                }
                if self.args.should_save(self.state.global_step) {
                    self.save_checkpoint(&optimizer, &*scheduler, epoch)?;
                }

                if self.state.global_step >= max_steps {
                    break 'epochs;
                }
                if self.stop.load(Ordering::SeqCst) {
                    tracing::warn!(step = self.state.global_step, "stop requested; ending training early");
                    stopped = true;
                    break 'epochs;
                }
            }

            if self.args.evaluates() && self.args.evaluation_strategy == EvaluationStrategy::Epoch {
                self.evaluate()?;
            }
        }

        if stopped && self.last_saved_step != Some(self.state.global_step) {
            let epoch = self.state.global_step / updates_per_epoch;
            self.save_checkpoint(&optimizer, &*scheduler, epoch)?;
        }

        let steps_run = self.state.global_step - start_step;
        let mut output_metrics = speed_metrics("train", start.elapsed(), samples_seen, Some(steps_run));
        let training_loss = metrics.train_loss();
        output_metrics.insert("train_loss".into(), training_loss);
        self.log(output_metrics.clone())?;

        for callback in self.callbacks.iter_mut() {
            callback.on_train_end(&self.args, &self.state)?;
        }
        tracing::info!(
            global_step = self.state.global_step,
            training_loss,
            "training completed"
        );

        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            metrics: output_metrics,
        })
    }

    /// Scores the validation split and reports `eval_*` metrics.
    pub fn evaluate(&mut self) -> Result<Logs, TrainingError> {
        let Some(dataset) = self.eval_dataset.as_ref() else {
            return Err(TrainingError::runtime("no validation dataset to evaluate"));
        };
        let start = Instant::now();
        let batch_size = self.args.per_device_eval_batch_size;
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let mut summary = EvaluationMetrics::default();

        for (batch_index, batch) in indices.chunks(batch_size).enumerate() {
            if let Some(limit) = self.args.max_eval_batches {
                if batch_index >= limit {
                    break;
                }
            }
            let input_ids = self.batch_tensor(dataset, batch)?;
            let logits = self
                .model
                .forward(&input_ids, false)
                .map_err(to_runtime_error)?;
            let output = self.loss.compute(&logits, &input_ids)?;
            summary.update(
                output.metrics.average_loss() as f64,
                output.metrics.total_tokens() as u64,
                output.metrics.correct_tokens() as u64,
                batch.len(),
            );
        }

        let logs = summary
            .finalize()
            .ok_or_else(|| TrainingError::runtime("evaluation produced no tokens"))?
            .to_logs(start.elapsed());
        self.log(logs.clone())?;
        for callback in self.callbacks.iter_mut() {
            callback.on_evaluate(&self.args, &self.state, &logs)?;
        }
        Ok(logs)
    }

    /// Writes the final weights, config and tokenizer into `output_dir`.
    pub fn save_model(&self) -> Result<PathBuf, TrainingError> {
        let dir = self.args.output_dir.clone();
        if !self.args.is_primary() {
            return Ok(dir);
        }
        self.model
            .save_pretrained(&dir)
            .map_err(|err| TrainingError::runtime(format!("failed to save model: {err}")))?;
        if let Some(tokenizer) = &self.tokenizer {
            tokenizer::artifacts::save_tokenizer_json(tokenizer, &dir.join(TOKENIZER_FILENAME))
                .map_err(|err| TrainingError::runtime(format!("failed to save tokenizer: {err}")))?;
        }
        tracing::info!(dir = %dir.display(), "saved model");
        Ok(dir)
    }

    fn log(&mut self, logs: Logs) -> Result<(), TrainingError> {
        let record = self.state.record(logs.clone());
        tracing::info!(
            step = record.step,
            "{}",
            record
                .values
                .iter()
                .map(|(key, value)| format!("{key}={value:.6}"))
                .collect::<Vec<_>>()
                .join(" ")
        );
        for callback in self.callbacks.iter_mut() {
            callback.on_log(&self.args, &self.state, &logs)?;
        }
        Ok(())
    }

    fn restore(
        &mut self,
        dir: &Path,
        optimizer: &mut TrainerOptimizer,
        scheduler: &mut dyn LRScheduler,
    ) -> Result<(), TrainingError> {
        let loaded = checkpoint::load_checkpoint(dir)?;
        self.model
            .load_safetensors(&loaded.weights_path())
            .map_err(|err| TrainingError::checkpoint(format!("failed to load weights: {err}")))?;
        optimizer.load_state(&loaded.directory)?;
        scheduler.load_snapshot(&loaded.scheduler)?;
        if loaded.rng.seed != self.args.seed {
            tracing::warn!(
                saved = loaded.rng.seed,
                configured = self.args.seed,
                "checkpoint was written with a different seed; data order will differ"
            );
        }
        self.state = loaded.state;
        self.last_saved_step = Some(self.state.global_step);
        tracing::info!(
            checkpoint = %loaded.directory.display(),
            global_step = self.state.global_step,
            "restored checkpoint"
        );
        Ok(())
    }

    fn save_checkpoint(
        &mut self,
        optimizer: &TrainerOptimizer,
        scheduler: &dyn LRScheduler,
        epoch: usize,
    ) -> Result<(), TrainingError> {
        if !self.args.is_primary() {
            return Ok(());
        }
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            output_dir: &self.args.output_dir,
            model: &self.model,
            optimizer,
            scheduler,
            state: &self.state,
            args: &self.args,
            rng: RngState {
                seed: self.args.seed,
                epoch,
            },
        })?;
        tracing::info!(
            checkpoint = %descriptor.directory.display(),
            step = self.state.global_step,
            "saved checkpoint"
        );
        self.last_saved_step = Some(self.state.global_step);
        checkpoint::rotate_checkpoints(&self.args.output_dir, self.args.save_total_limit)?;
        for callback in self.callbacks.iter_mut() {
            callback.on_save(&self.args, &self.state, &descriptor.directory)?;
        }
        Ok(())
    }

    fn batch_tensor(&self, dataset: &LmDataset, indices: &[usize]) -> Result<Tensor, TrainingError> {
        let seq_len = dataset.seq_len();
        let mut tokens = Vec::with_capacity(indices.len() * seq_len);
        for &index in indices {
            let block = dataset
                .block(index)
                .map_err(|err| TrainingError::runtime(format!("failed to read block {index}: {err}")))?;
            tokens.extend(block);
        }
        Tensor::from_vec(tokens, (indices.len(), seq_len), self.model.device()).map_err(to_runtime_error)
    }

    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), TrainingError> {
        for tensor in &self.parameter_tensors {
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }
}

/// Micro-batch losses of the optimizer step in progress.
#[derive(Debug, Default)]
struct StepWindow {
    loss_sum: f64,
    micro_batches: usize,
    tokens: usize,
}

impl StepWindow {
    fn accumulate(&mut self, metrics: &LossMetrics) {
        self.loss_sum += metrics.average_loss() as f64;
        self.micro_batches += 1;
        self.tokens += metrics.total_tokens();
    }

    fn take_mean_loss(&mut self) -> f64 {
        let mean = if self.micro_batches == 0 {
            0.0
        } else {
            self.loss_sum / self.micro_batches as f64
        };
        self.loss_sum = 0.0;
        self.micro_batches = 0;
        mean
    }

    fn take_tokens(&mut self) -> usize {
        std::mem::take(&mut self.tokens)
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
