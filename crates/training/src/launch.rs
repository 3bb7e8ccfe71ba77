use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use corpora::{DatasetRequest, LocalFiles};
use model::Gpt2LmHeadModel;
use tokenizer::TokenizerRequest;

use crate::{
    callbacks::{resume_tracking_id, ExperimentTrackingCallback, TrackingSettings, TrainerCallback},
    checkpoint::get_last_checkpoint,
    config::{LaunchConfig, TrainingError},
    overwatch,
    paths::{create_paths, resolve_run_id, set_permissions, RunPaths},
    seed::seed_everything,
    trainer::{select_device, TrainOutput, Trainer},
};

pub const FAREWELL: &str = "...and that's all folks!";

#[derive(Debug)]
pub struct LaunchOutcome {
    pub run_id: String,
    pub paths: RunPaths,
    pub resumed_from: Option<PathBuf>,
    pub train_output: Option<TrainOutput>,
    pub model_dir: PathBuf,
}

/// Runs one training launch end to end. Setting `stop` ends training after
/// the current optimizer step with a resumable checkpoint.
pub fn run(config: &LaunchConfig, stop: Arc<AtomicBool>) -> Result<LaunchOutcome, TrainingError> {
    let run_id = resolve_run_id(config);
    let paths = create_paths(
        &run_id,
        &config.model.id,
        &config.artifacts.run_dir,
        &config.artifacts.cache_dir,
    )?;

    let _overwatch = match overwatch::init(&paths.log_file(&run_id), config.log_level, config.infra.rank) {
        Ok(overwatch) => Some(overwatch),
        Err(err) => {
            tracing::warn!(error = %err, "keeping the already installed log subscriber");
            None
        }
    };
    tracing::info!(
        run_id = %run_id,
        model = %config.model.id,
        dataset = %config.dataset.id,
        run_dir = %paths.runs.display(),
        "starting launch"
    );

    let device = select_device();
    let mut rng = seed_everything(config.seed, &device)?;

    let (resumed_from, resume_id) = if config.resume {
        let checkpoint = get_last_checkpoint(&paths.runs)?.ok_or_else(|| {
            TrainingError::checkpoint("Cannot detect checkpoint in run dir. Resuming failed.")
        })?;
        let tracking_id = resume_tracking_id(&paths.runs);
        if tracking_id.is_none() {
            tracing::warn!("no previous tracking run found; resuming under a new tracking id");
        }
        tracing::info!(checkpoint = %checkpoint.display(), "resuming from checkpoint");
        (Some(checkpoint), tracking_id)
    } else {
        (None, None)
    };

    let entry = model::lookup(&config.model.id).ok_or_else(|| {
        TrainingError::initialization(format!("model id '{}' is not registered", config.model.id))
    })?;
    let mut model_config = model::resolve_config(&config.model.id, &config.model.overrides, &paths.configs)
        .map_err(|err| TrainingError::initialization(format!("failed to resolve model config: {err}")))?;

    if config.model.seq_len > model_config.n_positions {
        return Err(TrainingError::initialization(format!(
            "model.seq_len {} exceeds the {} positions of {}",
            config.model.seq_len, model_config.n_positions, config.model.id
        )));
    }

    let resolved = tokenizer::resolve(&TokenizerRequest {
        hub_id: entry.hub_id.to_string(),
        pretrained: config.model.pretrained_tokenizer,
        tokenizer_file: config.model.tokenizer_file.clone(),
        cache_dir: paths.tokenizer.clone(),
    })
    .map_err(|err| TrainingError::initialization(format!("failed to load tokenizer: {err}")))?;

    let datasets = corpora::get_auto_dataset(
        &resolved.tokenizer,
        &resolved.fingerprint,
        &DatasetRequest {
            dataset_id: config.dataset.id.clone(),
            name: config.dataset.name.clone(),
            validation_ratio: config.dataset.validation_ratio,
            seq_len: config.model.seq_len,
            num_proc: config.dataset.num_proc,
            files: config.dataset.files.as_ref().map(|files| LocalFiles {
                train: files.train.clone(),
                validation: files.validation.clone(),
            }),
            dataset_dir: paths.dataset.clone(),
            preprocessed_dir: paths.preprocessed.clone(),
        },
    )
    .map_err(|err| TrainingError::initialization(format!("failed to prepare dataset: {err}")))?;
    tracing::info!(
        train_blocks = datasets.train.len(),
        validation_blocks = datasets.validation.len(),
        cache = %datasets.cache_dir.display(),
        "dataset ready"
    );
    set_permissions(&paths);

    model_config.vocab_size = resolved.len();
    let model = Gpt2LmHeadModel::new(model_config, &device, &mut rng)
        .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;
    tracing::info!(
        parameters = model.num_parameters().unwrap_or_default(),
        vocab_size = resolved.len(),
        "initialized model from scratch"
    );

    let mut args = config.training_arguments.clone();
    args.output_dir = paths.runs.clone();
    args.run_name = run_id.clone();
    args.seed = config.seed;
    args.local_rank = config.infra.rank;

    let tracking = ExperimentTrackingCallback::new(
        &paths.runs,
        TrackingSettings {
            project: config.tracking.project.clone(),
            group: config.tracking.group.clone(),
            entity: config.tracking.entity.clone(),
            tensorboard: config.tracking.tensorboard,
            flush_every: config.tracking.flush_every,
            resume_id,
            config: serde_json::to_value(config)?,
        },
    );

    let callbacks: Vec<Box<dyn TrainerCallback>> = vec![Box::new(tracking)];
    let mut trainer = Trainer::new(
        model,
        args,
        datasets.train,
        Some(datasets.validation),
        Some(resolved.tokenizer),
        callbacks,
    )?;
    trainer.set_stop_flag(stop);

    let train_output = if trainer.args().do_train {
        Some(trainer.train(resumed_from.as_deref())?)
    } else {
        tracing::warn!("do_train is disabled; saving the freshly initialized model");
        None
    };
    let model_dir = trainer.save_model()?;

    tracing::info!("{FAREWELL}");
    Ok(LaunchOutcome {
        run_id,
        paths,
        resumed_from,
        train_output,
        model_dir,
    })
}
