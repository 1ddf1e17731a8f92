use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

/// Epoch-level learning-rate schedule. `step` is called once after each
/// completed epoch and returns the rate for the next one.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

/// Serializable scheduler position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: String,
    /// Number of `step` calls so far.
    pub last_epoch: usize,
    pub base_lr: f64,
    pub current_lr: f64,
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    StepDecay {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
    },
    Cosine {
        base_lr: f64,
        min_lr: f64,
        total_epochs: usize,
    },
    Constant {
        base_lr: f64,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_epochs: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires a positive base learning rate",
            ));
        }
        match cfg.strategy {
            config::LearningRateSchedule::Step => {
                if cfg.step_size == 0 {
                    return Err(TrainingError::initialization(
                        "step decay requires step_size greater than zero",
                    ));
                }
                Ok(SchedulerConfig::StepDecay {
                    base_lr,
                    step_size: cfg.step_size,
                    gamma: cfg.gamma,
                })
            }
            config::LearningRateSchedule::Cosine => {
                if total_epochs == 0 {
                    return Err(TrainingError::initialization(
                        "cosine schedule requires at least one epoch",
                    ));
                }
                Ok(SchedulerConfig::Cosine {
                    base_lr,
                    min_lr: cfg.min_lr.min(base_lr),
                    total_epochs,
                })
            }
            config::LearningRateSchedule::Constant => Ok(SchedulerConfig::Constant { base_lr }),
        }
    }

    pub fn build(self) -> Box<dyn LRScheduler> {
        match self {
            SchedulerConfig::StepDecay {
                base_lr,
                step_size,
                gamma,
            } => Box::new(StepDecay {
                base_lr,
                step_size,
                gamma,
                epoch: 0,
            }),
            SchedulerConfig::Cosine {
                base_lr,
                min_lr,
                total_epochs,
            } => Box::new(Cosine {
                base_lr,
                min_lr,
                total_epochs,
                epoch: 0,
            }),
            SchedulerConfig::Constant { base_lr } => Box::new(Constant { base_lr, epoch: 0 }),
        }
    }
}

fn check_snapshot(kind: &str, base_lr: f64, state: &SchedulerState) -> Result<(), TrainingError> {
    if state.kind != kind {
        return Err(TrainingError::checkpoint(format!(
            "scheduler state is for '{}' but the run uses '{kind}'",
            state.kind
        )));
    }
    if (state.base_lr - base_lr).abs() > f64::EPSILON * base_lr.abs().max(1.0) {
        log::warn!(
            "checkpoint base learning rate {} differs from configured {base_lr}; keeping the configured value",
            state.base_lr
        );
    }
    Ok(())
}

/// `base_lr * gamma^(epoch / step_size)`.
struct StepDecay {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepDecay {
    const KIND: &'static str = "step";
}

impl LRScheduler for StepDecay {
    fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        let decays = (self.epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: Self::KIND.to_string(),
            last_epoch: self.epoch,
            base_lr: self.base_lr,
            current_lr: self.learning_rate(),
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        check_snapshot(Self::KIND, self.base_lr, state)?;
        self.epoch = state.last_epoch;
        Ok(())
    }
}

/// Half-cosine from `base_lr` down to `min_lr` over `total_epochs`.
struct Cosine {
    base_lr: f64,
    min_lr: f64,
    total_epochs: usize,
    epoch: usize,
}

impl Cosine {
    const KIND: &'static str = "cosine";
}

impl LRScheduler for Cosine {
    fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        let progress = (self.epoch.min(self.total_epochs) as f64) / self.total_epochs as f64;
        let cosine = 0.5 * (1.0 + (PI * progress).cos());
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: Self::KIND.to_string(),
            last_epoch: self.epoch,
            base_lr: self.base_lr,
            current_lr: self.learning_rate(),
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        check_snapshot(Self::KIND, self.base_lr, state)?;
        self.epoch = state.last_epoch;
        Ok(())
    }
}

struct Constant {
    base_lr: f64,
    epoch: usize,
}

impl Constant {
    const KIND: &'static str = "constant";
}

impl LRScheduler for Constant {
    fn step(&mut self) -> f64 {
        self.epoch += 1;
        self.base_lr
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: Self::KIND.to_string(),
            last_epoch: self.epoch,
            base_lr: self.base_lr,
            current_lr: self.base_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        check_snapshot(Self::KIND, self.base_lr, state)?;
        self.epoch = state.last_epoch;
        Ok(())
    }
}
