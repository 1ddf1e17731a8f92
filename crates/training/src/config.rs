use std::{
    fs,
    path::{Path, PathBuf},
};

use model::Architecture;
use serde::{Deserialize, Serialize};

use crate::{device::DeviceRequest, distributed::Backend, metrics::Summary, TrainingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.arch.parse::<Architecture>() {
            errors.push(format!("model.arch: {err}"));
        }
        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        match &self.data.dummy {
            Some(dummy) => {
                if dummy.train_size == 0 || dummy.val_size == 0 {
                    errors.push("data.dummy sizes must be greater than 0".to_string());
                }
                if dummy.feature_dim == 0 {
                    errors.push("data.dummy.feature_dim must be greater than 0".to_string());
                }
                if dummy.num_classes < 2 {
                    errors.push("data.dummy.num_classes must be at least 2".to_string());
                }
            }
            None => {
                if self.data.train.is_none() {
                    errors.push("data.train is required unless data.dummy is set".to_string());
                }
                if self.data.validation.is_none() {
                    errors
                        .push("data.validation is required unless data.dummy is set".to_string());
                }
            }
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if self.scheduler.step_size == 0 {
            errors.push("scheduler.step_size must be greater than 0".to_string());
        }
        if self.scheduler.gamma <= 0.0 {
            errors.push("scheduler.gamma must be greater than 0".to_string());
        }
        if self.scheduler.min_lr < 0.0 || self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr must be in [0, optimizer.learning_rate]".to_string());
        }

        if self.runtime.start_epoch > self.runtime.epochs {
            errors.push("runtime.start_epoch cannot exceed runtime.epochs".to_string());
        }
        if self.runtime.print_freq == 0 {
            errors.push("runtime.print_freq must be greater than 0".to_string());
        }
        if self.runtime.telemetry_every == 0 {
            errors.push("runtime.telemetry_every must be greater than 0".to_string());
        }
        if self.runtime.topk.is_empty() {
            errors.push("runtime.topk must list at least one k".to_string());
        }
        if self.runtime.topk.iter().any(|k| *k == 0) {
            errors.push("runtime.topk entries must be greater than 0".to_string());
        }
        if let Err(err) = self.runtime.device.parse::<DeviceRequest>() {
            errors.push(format!("runtime.device: {err}"));
        }
        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }
        if self.runtime.checkpoint.latest.is_empty() || self.runtime.checkpoint.best.is_empty() {
            errors.push("runtime.checkpoint artifact names must not be empty".to_string());
        }
        if self.runtime.checkpoint.latest == self.runtime.checkpoint.best {
            errors.push("runtime.checkpoint.latest and best must differ".to_string());
        }
        for (label, kind) in [
            ("runtime.evaluation.loss_summary", &self.runtime.evaluation.loss_summary),
            (
                "runtime.evaluation.accuracy_summary",
                &self.runtime.evaluation.accuracy_summary,
            ),
        ] {
            if let Err(TrainingError::Validation(messages)) = kind.parse::<Summary>() {
                errors.extend(messages.into_iter().map(|msg| format!("{label}: {msg}")));
            }
        }

        if let Some(0) = self.distributed.world_size {
            errors.push("distributed.world_size must be greater than 0".to_string());
        }
        if let (Some(world_size), Some(rank)) = (self.distributed.world_size, self.distributed.rank)
        {
            if rank >= world_size {
                errors.push(format!(
                    "distributed.rank {rank} must be below distributed.world_size {world_size}"
                ));
            }
        }
        if self.distributed.spawn && self.distributed.backend == Backend::Tcp {
            errors.push("distributed.spawn runs ranks as threads; use backend in_process".to_string());
        }
        if self.distributed.timeout_secs == 0 {
            errors.push("distributed.timeout_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            arch: default_arch(),
            hidden_size: default_hidden_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// JSON-lines training records (`id`, `features`, `label`).
    #[serde(default)]
    pub train: Option<PathBuf>,
    #[serde(default)]
    pub validation: Option<PathBuf>,
    /// Whitespace-separated annotation file that relabels the validation records.
    #[serde(default)]
    pub val_annotations: Option<PathBuf>,
    #[serde(default)]
    pub dummy: Option<DummyDataConfig>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train: None,
            validation: None,
            val_annotations: None,
            dummy: None,
            batch_size: default_batch_size(),
            workers: default_workers(),
        }
    }
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.train.as_mut(),
            self.validation.as_mut(),
            self.val_annotations.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyDataConfig {
    #[serde(default = "default_dummy_train_size")]
    pub train_size: usize,
    #[serde(default = "default_dummy_val_size")]
    pub val_size: usize,
    #[serde(default = "default_dummy_feature_dim")]
    pub feature_dim: usize,
    #[serde(default = "default_dummy_num_classes")]
    pub num_classes: usize,
}

impl Default for DummyDataConfig {
    fn default() -> Self {
        Self {
            train_size: default_dummy_train_size(),
            val_size: default_dummy_val_size(),
            feature_dim: default_dummy_feature_dim(),
            num_classes: default_dummy_num_classes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default)]
    pub min_lr: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            step_size: default_step_size(),
            gamma: default_gamma(),
            min_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Step,
    Cosine,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub start_epoch: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
    #[serde(default = "default_telemetry_every")]
    pub telemetry_every: usize,
    #[serde(default = "default_topk")]
    pub topk: Vec<usize>,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub resume: Option<PathBuf>,
    #[serde(default)]
    pub evaluate_only: bool,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            start_epoch: 0,
            seed: None,
            print_freq: default_print_freq(),
            telemetry_every: default_telemetry_every(),
            topk: default_topk(),
            device: default_device(),
            resume: None,
            evaluate_only: false,
            checkpoint: CheckpointConfig::default(),
            evaluation: EvaluationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(resume) = self.resume.as_mut() {
            absolutize_in_place(resume, base);
        }
        absolutize_in_place(&mut self.checkpoint.directory, base);
        if let Some(report) = self.evaluation.misclassified_report.as_mut() {
            absolutize_in_place(report, base);
        }
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_latest_name")]
    pub latest: String,
    #[serde(default = "default_best_name")]
    pub best: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            latest: default_latest_name(),
            best: default_best_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_misclassified_report")]
    pub misclassified_report: Option<PathBuf>,
    #[serde(default = "default_loss_summary")]
    pub loss_summary: String,
    #[serde(default = "default_accuracy_summary")]
    pub accuracy_summary: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            misclassified_report: default_misclassified_report(),
            loss_summary: default_loss_summary(),
            accuracy_summary: default_accuracy_summary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Taken from `WORLD_SIZE` when unset and `init_method` is `env://`.
    #[serde(default)]
    pub world_size: Option<usize>,
    /// Taken from `RANK` when unset and `init_method` is `env://`.
    #[serde(default)]
    pub rank: Option<usize>,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_init_method")]
    pub init_method: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Run every rank as a thread of this process.
    #[serde(default)]
    pub spawn: bool,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: None,
            rank: None,
            backend: Backend::default(),
            init_method: default_init_method(),
            timeout_secs: default_timeout_secs(),
            spawn: false,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_arch() -> String {
    "mlp".to_string()
}

fn default_hidden_size() -> usize {
    128
}

fn default_batch_size() -> usize {
    256
}

fn default_workers() -> usize {
    4
}

fn default_dummy_train_size() -> usize {
    4_096
}

fn default_dummy_val_size() -> usize {
    1_000
}

fn default_dummy_feature_dim() -> usize {
    64
}

fn default_dummy_num_classes() -> usize {
    200
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_step_size() -> usize {
    30
}

fn default_gamma() -> f64 {
    0.1
}

fn default_epochs() -> usize {
    90
}

fn default_print_freq() -> usize {
    10
}

fn default_telemetry_every() -> usize {
    40
}

fn default_topk() -> Vec<usize> {
    vec![1, 5]
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_latest_name() -> String {
    "checkpoint".to_string()
}

fn default_best_name() -> String {
    "model_best".to_string()
}

fn default_misclassified_report() -> Option<PathBuf> {
    Some(PathBuf::from("wrong.txt"))
}

fn default_loss_summary() -> String {
    "none".to_string()
}

fn default_accuracy_summary() -> String {
    "average".to_string()
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    1
}

fn default_init_method() -> String {
    "tcp://127.0.0.1:23456".to_string()
}

fn default_timeout_secs() -> u64 {
    1_800
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_config() -> TrainingConfig {
        TrainingConfig {
            model: ModelSettings::default(),
            data: DataConfig {
                dummy: Some(DummyDataConfig::default()),
                ..DataConfig::default()
            },
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            runtime: RuntimeConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }

    #[test]
    fn defaults_validate_with_dummy_data() {
        dummy_config().validate().unwrap();
    }

    #[test]
    fn missing_data_sources_are_reported_together() {
        let mut config = dummy_config();
        config.data.dummy = None;
        config.data.batch_size = 0;
        let err = config.validate().unwrap_err();
        match err {
            TrainingError::Validation(messages) => {
                assert_eq!(messages.len(), 3, "{messages:?}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_summary_kind_is_a_configuration_error() {
        let mut config = dummy_config();
        config.runtime.evaluation.accuracy_summary = "median".to_string();
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("accuracy_summary"), "{message}");
        assert!(message.contains("median"), "{message}");
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        let mut config = dummy_config();
        config.distributed.world_size = Some(2);
        config.distributed.rank = Some(2);
        assert!(matches!(
            config.validate(),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn toml_sections_deserialize_with_defaults() {
        let config: TrainingConfig = toml::from_str(
            r#"
            [model]
            arch = "linear"

            [data.dummy]
            train_size = 42

            [runtime]
            epochs = 3
            topk = [1, 3]

            [distributed]
            world_size = 4
            backend = "in_process"
            spawn = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.data.dummy.as_ref().unwrap().train_size, 42);
        assert_eq!(config.runtime.topk, vec![1, 3]);
        assert_eq!(config.runtime.checkpoint.latest, "checkpoint");
        assert_eq!(config.distributed.backend, Backend::InProcess);
        assert_eq!(config.scheduler.strategy, LearningRateSchedule::Step);
    }
}
