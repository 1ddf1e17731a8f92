use std::fs;

use candle_core::{DType, Device, Tensor};
use model::{Architecture, Model, ModelConfig};
use training::{
    checkpoint::fingerprint_config,
    config::{CheckpointConfig, LearningRateSchedule, SchedulerConfig as ScheduleSettings},
    distributed::DistributedContext,
    loss::CrossEntropyLoss,
    optimizer::{Sgd, SgdConfig},
    scheduler::{LRScheduler, SchedulerConfig},
    CheckpointManager, SaveOutcome, TrainingConfig, TrainingError, TrainingState,
};

struct Replica {
    model: Model,
    optimizer: Sgd,
    scheduler: Box<dyn LRScheduler>,
}

fn replica(init_seed: u64) -> Replica {
    let model = Model::new(ModelConfig {
        arch: Architecture::Mlp,
        input_dim: 4,
        hidden_dim: 6,
        num_classes: 3,
        dtype: DType::F32,
        device: Device::Cpu,
        init_seed,
    })
    .unwrap();
    let optimizer = Sgd::new(
        model.parameters(),
        SgdConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 1e-4,
        },
    )
    .unwrap();
    let scheduler = SchedulerConfig::from_training_config(
        &ScheduleSettings {
            strategy: LearningRateSchedule::Step,
            step_size: 2,
            gamma: 0.1,
            min_lr: 0.0,
        },
        0.1,
        10,
    )
    .unwrap()
    .build();
    Replica {
        model,
        optimizer,
        scheduler,
    }
}

fn train_steps(replica: &mut Replica, steps: usize) {
    let inputs = Tensor::new(
        &[[0.5f32, -1.0, 0.25, 2.0], [1.0, 0.0, -0.5, 0.5]],
        &Device::Cpu,
    )
    .unwrap();
    let targets = Tensor::new(&[2u32, 0], &Device::Cpu).unwrap();
    for _ in 0..steps {
        let logits = replica.model.forward(&inputs).unwrap();
        let output = CrossEntropyLoss::new().compute(&logits, &targets).unwrap();
        let mut grads = output.loss.backward().unwrap();
        replica.optimizer.step(&mut grads).unwrap();
        let lr = replica.scheduler.step();
        replica.optimizer.set_learning_rate(lr);
    }
}

fn weights(model: &Model) -> Vec<(String, Vec<f32>)> {
    model
        .parameters()
        .into_iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name, values)
        })
        .collect()
}

fn manager(dir: &std::path::Path) -> CheckpointManager {
    let config = CheckpointConfig {
        directory: dir.to_path_buf(),
        ..CheckpointConfig::default()
    };
    CheckpointManager::new(&config, &DistributedContext::single(), "fingerprint", Some(3))
}

fn manifest_epoch(dir: &std::path::Path) -> u64 {
    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("manifest.json")).unwrap()).unwrap();
    manifest["epoch"].as_u64().unwrap()
}

#[test]
fn resumed_state_matches_the_saved_run() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());

    let mut original = replica(1);
    train_steps(&mut original, 3);
    let state = TrainingState::capture(
        5,
        &original.model,
        &original.optimizer,
        original.scheduler.as_ref(),
        41.5,
    )
    .unwrap();
    let outcome = manager.save(&state, false).unwrap();
    assert_eq!(
        outcome,
        SaveOutcome::Saved {
            latest: manager.latest_path(),
            best: None
        }
    );
    assert!(!manager.best_path().exists());

    let loaded = manager.load(&manager.latest_path()).unwrap().unwrap();
    assert_eq!(loaded.epoch, 5);
    assert_eq!(loaded.resume_epoch(), 6);
    assert_eq!(loaded.best_metric, 41.5);

    let mut restored = replica(99);
    assert_ne!(weights(&restored.model), weights(&original.model));
    loaded
        .restore_into(
            &restored.model,
            &mut restored.optimizer,
            restored.scheduler.as_mut(),
        )
        .unwrap();
    assert_eq!(weights(&restored.model), weights(&original.model));
    assert_eq!(
        restored.optimizer.state().unwrap(),
        original.optimizer.state().unwrap()
    );
    assert_eq!(restored.scheduler.snapshot(), original.scheduler.snapshot());

    // identical updates from identical state
    train_steps(&mut original, 2);
    train_steps(&mut restored, 2);
    assert_eq!(weights(&restored.model), weights(&original.model));
}

#[test]
fn best_copy_only_follows_improvements() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let replica = replica(1);

    let mut state = TrainingState::capture(
        0,
        &replica.model,
        &replica.optimizer,
        replica.scheduler.as_ref(),
        0.0,
    )
    .unwrap();
    assert!(state.observe(55.2));
    let outcome = manager.save(&state, true).unwrap();
    assert_eq!(
        outcome,
        SaveOutcome::Saved {
            latest: manager.latest_path(),
            best: Some(manager.best_path())
        }
    );

    let mut state = TrainingState::capture(
        1,
        &replica.model,
        &replica.optimizer,
        replica.scheduler.as_ref(),
        state.best_metric,
    )
    .unwrap();
    assert!(!state.observe(50.0));
    assert_eq!(state.best_metric, 55.2);
    manager.save(&state, false).unwrap();

    assert_eq!(manifest_epoch(&manager.latest_path()), 1);
    assert_eq!(manifest_epoch(&manager.best_path()), 0);
    let best = manager.load(&manager.best_path()).unwrap().unwrap();
    assert_eq!(best.best_metric, 55.2);
}

#[test]
fn missing_checkpoint_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    assert!(manager.load(&dir.path().join("absent")).unwrap().is_none());
}

#[test]
fn corrupted_weights_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let replica = replica(1);
    let state = TrainingState::capture(
        2,
        &replica.model,
        &replica.optimizer,
        replica.scheduler.as_ref(),
        10.0,
    )
    .unwrap();
    manager.save(&state, false).unwrap();

    let weights_path = manager.latest_path().join("model.safetensors");
    let mut bytes = fs::read(&weights_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&weights_path, bytes).unwrap();

    let err = manager.load(&manager.latest_path()).unwrap_err();
    assert!(matches!(err, TrainingError::Checkpoint(_)), "{err}");
}

#[test]
fn architecture_mismatch_is_rejected_on_restore() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let source = replica(1);
    let state = TrainingState::capture(
        0,
        &source.model,
        &source.optimizer,
        source.scheduler.as_ref(),
        0.0,
    )
    .unwrap();
    manager.save(&state, false).unwrap();
    let loaded = manager.load(&manager.latest_path()).unwrap().unwrap();

    let linear = Model::new(ModelConfig {
        arch: Architecture::Linear,
        input_dim: 4,
        hidden_dim: 6,
        num_classes: 3,
        dtype: DType::F32,
        device: Device::Cpu,
        init_seed: 0,
    })
    .unwrap();
    let mut optimizer = Sgd::new(
        linear.parameters(),
        SgdConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
        },
    )
    .unwrap();
    let mut scheduler = replica(0).scheduler;
    let err = loaded
        .restore_into(&linear, &mut optimizer, scheduler.as_mut())
        .unwrap_err();
    assert!(matches!(err, TrainingError::Checkpoint(_)), "{err}");
}

#[test]
fn config_fingerprint_tracks_content() {
    let base = TrainingConfig {
        model: Default::default(),
        data: Default::default(),
        optimizer: Default::default(),
        scheduler: Default::default(),
        runtime: Default::default(),
        distributed: Default::default(),
    };
    let mut changed = base.clone();
    changed.optimizer.learning_rate = 0.05;

    let first = fingerprint_config(&base).unwrap();
    assert_eq!(first, fingerprint_config(&base.clone()).unwrap());
    assert_eq!(first.len(), 64);
    assert_ne!(first, fingerprint_config(&changed).unwrap());
}

#[test]
fn interrupted_swap_still_resumes_from_the_previous_copy() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let replica = replica(1);
    let state = TrainingState::capture(
        3,
        &replica.model,
        &replica.optimizer,
        replica.scheduler.as_ref(),
        20.0,
    )
    .unwrap();
    manager.save(&state, true).unwrap();

    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["checkpoint", "model_best"]);

    // the old copy was moved aside and the new one never landed
    let latest = manager.latest_path();
    fs::rename(&latest, dir.path().join(".checkpoint.old")).unwrap();
    let loaded = manager.load(&latest).unwrap().unwrap();
    assert_eq!(loaded.epoch, 3);

    let next = TrainingState::capture(
        4,
        &replica.model,
        &replica.optimizer,
        replica.scheduler.as_ref(),
        20.0,
    )
    .unwrap();
    manager.save(&next, false).unwrap();
    assert_eq!(manifest_epoch(&latest), 4);
    assert!(!dir.path().join(".checkpoint.old").exists());
}
