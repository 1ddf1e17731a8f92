use std::sync::Arc;

use candle_core::DType;
use model::{Architecture, Model, ModelConfig};

use crate::{
    checkpoint::{fingerprint_config, CheckpointManager, SaveOutcome, TrainingState},
    data::{build_datasets, Partition},
    device::{DeviceRequest, ExecutionTarget},
    distributed::{grad_sync, spawn_workers, Collective, DistributedContext, GroupSettings},
    evaluator::{EvaluationSettings, EvaluationSummary, Evaluator},
    logging::build_sink,
    optimizer::{Sgd, SgdConfig},
    scheduler::SchedulerConfig,
    trainer::{Trainer, TrainerSettings},
    TrainingConfig, TrainingError,
};

/// What one rank did during [`run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub rank: usize,
    pub start_epoch: usize,
    pub epochs_completed: usize,
    pub best_metric: f64,
    pub last_evaluation: Option<EvaluationSummary>,
    /// The stop callback fired before every epoch had run.
    pub stopped_early: bool,
}

/// Joins or launches the process group described by `config.distributed` and
/// runs every local rank to completion. Outcomes come back in rank order.
///
/// `should_stop` is polled at each epoch boundary; a stop seen by any rank
/// ends the run on all of them.
pub fn run(
    config: &TrainingConfig,
    should_stop: &(dyn Fn() -> bool + Sync),
) -> Result<Vec<RunOutcome>, TrainingError> {
    let settings = GroupSettings::resolve(&config.distributed)?;
    log::info!(
        "starting {} rank(s) with backend {}",
        settings.world_size,
        settings.backend
    );

    if settings.spawn {
        spawn_workers(
            settings.world_size,
            Some(settings.timeout),
            |context, collective| run_worker(config, context, collective, should_stop),
        )
    } else {
        let (context, collective) = settings.connect()?;
        Ok(vec![run_worker(config, context, collective, should_stop)?])
    }
}

/// Full lifecycle of one rank: build, optionally resume, then train and
/// evaluate epoch by epoch, checkpointing after each.
pub fn run_worker(
    config: &TrainingConfig,
    context: DistributedContext,
    collective: Arc<dyn Collective>,
    should_stop: &(dyn Fn() -> bool + Sync),
) -> Result<RunOutcome, TrainingError> {
    let runtime = &config.runtime;
    let rank = context.rank();

    if runtime.seed.is_some() && context.is_coordinator() {
        log::warn!(
            "seeded training is deterministic and may be slower; \
             restarting from checkpoints can still diverge"
        );
    }

    let request = runtime
        .device
        .parse::<DeviceRequest>()
        .map_err(|err| TrainingError::initialization(format!("runtime.device: {err}")))?;
    let target = ExecutionTarget::resolve(request, rank)?;
    if let Some(seed) = runtime.seed {
        target.seed(seed);
    }
    log::info!("rank {rank}/{} running on {target}", context.world_size());
    let device = target.device().clone();

    let (train_set, val_set) = build_datasets(&config.data, runtime.seed)?;

    let arch = config
        .model
        .arch
        .parse::<Architecture>()
        .map_err(|err| TrainingError::initialization(format!("model.arch: {err}")))?;
    if context.is_coordinator() {
        log::info!("=> creating model '{arch}'");
    }
    let model = Model::new(ModelConfig {
        arch,
        input_dim: train_set.feature_dim(),
        hidden_dim: config.model.hidden_size,
        num_classes: train_set.num_classes(),
        dtype: DType::F32,
        device: device.clone(),
        init_seed: runtime.seed.unwrap_or_else(rand::random),
    })
    .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;

    let mut optimizer = Sgd::new(model.parameters(), SgdConfig::from(&config.optimizer))?;
    let mut scheduler = SchedulerConfig::from_training_config(
        &config.scheduler,
        config.optimizer.learning_rate,
        runtime.epochs,
    )?
    .build();

    let manager = CheckpointManager::new(
        &runtime.checkpoint,
        &context,
        fingerprint_config(config)?,
        runtime.seed,
    );

    let mut start_epoch = runtime.start_epoch;
    let mut best_metric = 0.0;
    if let Some(path) = &runtime.resume {
        match manager.load(path)? {
            Some(state) => {
                state.restore_into(&model, &mut optimizer, scheduler.as_mut())?;
                start_epoch = state.resume_epoch();
                best_metric = state.best_metric;
                log::info!(
                    "=> loaded checkpoint '{}' (epoch {})",
                    path.display(),
                    state.epoch
                );
            }
            None => log::warn!("=> no checkpoint found at '{}'", path.display()),
        }
    }

    grad_sync::broadcast_parameters(collective.as_ref(), &model.parameters(), 0)?;

    let seed = runtime.seed.unwrap_or(0);
    let mut train_partition = Partition::new(
        train_set,
        &context,
        true,
        false,
        seed,
        config.data.batch_size,
        config.data.workers,
    );
    let val_partition = Partition::new(
        val_set,
        &context,
        false,
        true,
        seed,
        config.data.batch_size,
        config.data.workers,
    );

    let mut sink = build_sink(&runtime.logging, &context)?;
    let trainer = Trainer::new(
        device.clone(),
        Arc::clone(&collective),
        TrainerSettings::from_config(runtime),
    );
    let evaluator = Evaluator::new(
        device,
        Arc::clone(&collective),
        EvaluationSettings::from_config(runtime)?,
    );

    let mut outcome = RunOutcome {
        rank,
        start_epoch,
        epochs_completed: 0,
        best_metric,
        last_evaluation: None,
        stopped_early: false,
    };

    if runtime.evaluate_only {
        let summary = evaluator.evaluate(None, &model, &val_partition, sink.as_mut())?;
        outcome.last_evaluation = Some(summary);
        return Ok(outcome);
    }

    for epoch in start_epoch..runtime.epochs {
        let mut stop = [if should_stop() { 1.0 } else { 0.0 }];
        collective.all_reduce_sum(&mut stop)?;
        if stop[0] > 0.0 {
            log::warn!("rank {rank}: stop requested, leaving before epoch {epoch}");
            outcome.stopped_early = true;
            break;
        }

        let trained = trainer.train_epoch(
            epoch,
            &model,
            &mut optimizer,
            &mut train_partition,
            sink.as_mut(),
        )?;
        let evaluation = evaluator.evaluate(Some(epoch), &model, &val_partition, sink.as_mut())?;
        sink.emit_scalar("train/elapsed_secs", trained.elapsed_secs, epoch as u64)?;

        let learning_rate = scheduler.step();
        optimizer.set_learning_rate(learning_rate);

        let mut state = TrainingState::capture(
            epoch,
            &model,
            &optimizer,
            scheduler.as_ref(),
            outcome.best_metric,
        )?;
        let is_best = state.observe(evaluation.primary_accuracy());
        outcome.best_metric = state.best_metric;

        match manager.save(&state, is_best)? {
            SaveOutcome::Saved {
                latest,
                best: Some(best),
            } => log::info!(
                "saved {} and {} (best acc {:.3})",
                latest.display(),
                best.display(),
                outcome.best_metric
            ),
            SaveOutcome::Saved { latest, best: None } => {
                log::info!("saved {}", latest.display())
            }
            SaveOutcome::Skipped => {}
        }

        if context.is_coordinator() {
            log::info!(
                "epoch {epoch}: train loss {:.4} acc {:.2} | val loss {:.4} acc {:.2} | next lr {learning_rate:.6}",
                trained.loss,
                trained.accuracy.first().map(|(_, v)| *v).unwrap_or(0.0),
                evaluation.loss,
                evaluation.primary_accuracy(),
            );
        }

        outcome.epochs_completed += 1;
        outcome.last_evaluation = Some(evaluation);
    }

    sink.flush()?;
    collective.barrier()?;
    Ok(outcome)
}
