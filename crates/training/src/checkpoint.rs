use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor};
use hex::encode as hex_encode;
use model::Model;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::CheckpointConfig,
    distributed::DistributedContext,
    optimizer::{OptimizerState, Sgd},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub epoch: usize,
    pub arch: String,
    pub best_metric: f64,
    pub seed: Option<u64>,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
}

/// Everything needed to continue a run after the epoch it was captured at.
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Last completed epoch.
    pub epoch: usize,
    pub arch: String,
    /// Parameter tensors by name, held on the CPU.
    pub model_state: HashMap<String, Tensor>,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    /// Best validation top-1 so far; never decreases within a run.
    pub best_metric: f64,
}

impl TrainingState {
    pub fn capture(
        epoch: usize,
        model: &Model,
        optimizer: &Sgd,
        scheduler: &dyn LRScheduler,
        best_metric: f64,
    ) -> Result<Self, TrainingError> {
        let mut model_state = HashMap::new();
        for (name, var) in model.parameters() {
            let tensor = var
                .as_tensor()
                .to_device(&Device::Cpu)
                .map_err(|err| TrainingError::runtime(format!("failed to copy {name}: {err}")))?;
            model_state.insert(name, tensor);
        }
        Ok(Self {
            epoch,
            arch: model.arch().name().to_string(),
            model_state,
            optimizer_state: optimizer.state()?,
            scheduler_state: scheduler.snapshot(),
            best_metric,
        })
    }

    /// Folds a new validation score into the best metric and reports whether
    /// it improved on the previous best.
    pub fn observe(&mut self, metric: f64) -> bool {
        let is_best = metric > self.best_metric;
        self.best_metric = self.best_metric.max(metric);
        is_best
    }

    /// First epoch a resumed run executes.
    pub fn resume_epoch(&self) -> usize {
        self.epoch + 1
    }

    /// Writes the captured weights, optimizer and scheduler state back.
    pub fn restore_into(
        &self,
        model: &Model,
        optimizer: &mut Sgd,
        scheduler: &mut dyn LRScheduler,
    ) -> Result<(), TrainingError> {
        if self.arch != model.arch().name() {
            return Err(TrainingError::checkpoint(format!(
                "checkpoint holds a '{}' model but the run builds '{}'",
                self.arch,
                model.arch()
            )));
        }
        apply_model_weights(model, &self.model_state)?;
        optimizer.load_state(self.optimizer_state.clone())?;
        scheduler.load_snapshot(&self.scheduler_state)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Only the coordinator writes checkpoints.
    Skipped,
    Saved {
        latest: PathBuf,
        best: Option<PathBuf>,
    },
}

/// Persists [`TrainingState`] as a directory of manifest, weights and JSON state.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
    latest: String,
    best: String,
    coordinator: bool,
    config_sha256: String,
    seed: Option<u64>,
}

impl CheckpointManager {
    pub fn new(
        config: &CheckpointConfig,
        context: &DistributedContext,
        config_sha256: impl Into<String>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            directory: config.directory.clone(),
            latest: config.latest.clone(),
            best: config.best.clone(),
            coordinator: context.is_coordinator(),
            config_sha256: config_sha256.into(),
            seed,
        }
    }

    pub fn latest_path(&self) -> PathBuf {
        self.directory.join(&self.latest)
    }

    pub fn best_path(&self) -> PathBuf {
        self.directory.join(&self.best)
    }

    /// Writes the latest artifact and, when `is_best`, replaces the best copy with it.
    pub fn save(&self, state: &TrainingState, is_best: bool) -> Result<SaveOutcome, TrainingError> {
        if !self.coordinator {
            return Ok(SaveOutcome::Skipped);
        }
        fs::create_dir_all(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;

        let latest = self.latest_path();
        let staging = self.staging_path(&self.latest);
        reset_dir(&staging)?;
        self.write_contents(&staging, state)?;
        replace_dir(&staging, &latest)?;

        let best = if is_best {
            let best = self.best_path();
            let staging = self.staging_path(&self.best);
            reset_dir(&staging)?;
            copy_files(&latest, &staging)?;
            replace_dir(&staging, &best)?;
            Some(best)
        } else {
            None
        };

        Ok(SaveOutcome::Saved { latest, best })
    }

    /// Reads a checkpoint directory. A missing path is not an error.
    ///
    /// If `path` is missing but the copy it was replacing survived an
    /// interrupted save, that copy is read instead.
    pub fn load(&self, path: &Path) -> Result<Option<TrainingState>, TrainingError> {
        let retired = retired_path(path);
        let source = if !path.exists() && retired.is_dir() {
            log::warn!(
                "{} is missing; reading the previous copy at {}",
                path.display(),
                retired.display()
            );
            retired.as_path()
        } else {
            path
        };
        let Some((manifest, state)) = read_checkpoint(source)? else {
            return Ok(None);
        };
        if manifest.config_sha256 != self.config_sha256 {
            log::warn!(
                "checkpoint {} was written with a different configuration",
                path.display()
            );
        }
        if manifest.seed != self.seed {
            log::warn!(
                "checkpoint seed {:?} differs from configured seed {:?}",
                manifest.seed,
                self.seed
            );
        }
        Ok(Some(state))
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!(".{name}.partial"))
    }

    fn write_contents(&self, dir: &Path, state: &TrainingState) -> Result<(), TrainingError> {
        let model_path = dir.join(MODEL_FILENAME);
        save_model_state(&state.model_state, &model_path)?;
        let optimizer_path = dir.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &state.optimizer_state)?;
        let scheduler_path = dir.join(SCHEDULER_FILENAME);
        write_json(&scheduler_path, &state.scheduler_state)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.config_sha256.clone(),
            epoch: state.epoch,
            arch: state.arch.clone(),
            best_metric: state.best_metric,
            seed: self.seed,
            model: file_record(&model_path)?,
            optimizer: file_record(&optimizer_path)?,
            scheduler: file_record(&scheduler_path)?,
        };
        write_json(&dir.join(MANIFEST_FILENAME), &manifest)
    }
}

fn read_checkpoint(
    directory: &Path,
) -> Result<Option<(CheckpointManifest, TrainingState)>, TrainingError> {
    if !directory.exists() {
        return Ok(None);
    }
    if !directory.is_dir() {
        return Err(TrainingError::checkpoint(format!(
            "{} is not a checkpoint directory",
            directory.display()
        )));
    }

    let manifest: CheckpointManifest = read_json(&directory.join(MANIFEST_FILENAME))?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;
    let model_state = safetensors::load(&model_path, &Device::Cpu).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read model weights {}: {err}",
            model_path.display()
        ))
    })?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    let scheduler_path = directory.join(&manifest.scheduler.filename);
    validate_file(&scheduler_path, &manifest.scheduler.sha256)?;
    let scheduler_state: SchedulerState = read_json(&scheduler_path)?;

    let state = TrainingState {
        epoch: manifest.epoch,
        arch: manifest.arch.clone(),
        model_state,
        optimizer_state,
        scheduler_state,
        best_metric: manifest.best_metric,
    };
    Ok(Some((manifest, state)))
}

/// Copies named tensors into the model's parameters on the model's device.
pub fn apply_model_weights(
    model: &Model,
    tensors: &HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    let device = model.config().device.clone();
    let mut remaining: HashMap<&str, &Tensor> =
        tensors.iter().map(|(name, t)| (name.as_str(), t)).collect();

    for (name, var) in model.parameters() {
        let tensor = remaining.remove(name.as_str()).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::checkpoint(format!(
                "parameter {name} has shape {:?} in the checkpoint but {:?} in the model",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let value = tensor
            .to_device(&device)
            .and_then(|t| t.to_dtype(var.as_tensor().dtype()))
            .map_err(|err| TrainingError::checkpoint(format!("failed to load {name}: {err}")))?;
        var.set(&value)
            .map_err(|err| TrainingError::checkpoint(format!("failed to load {name}: {err}")))?;
    }

    if !remaining.is_empty() {
        let mut extra: Vec<_> = remaining.keys().copied().collect();
        extra.sort_unstable();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn save_model_state(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<(), TrainingError> {
    if tensors.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    safetensors::save(tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn reset_dir(path: &Path) -> Result<(), TrainingError> {
    if path.exists() {
        fs::remove_dir_all(path).map_err(|err| {
            TrainingError::runtime(format!("failed to remove {}: {err}", path.display()))
        })?;
    }
    fs::create_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })
}

/// Where `target` is parked while its replacement is moved into place.
fn retired_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.old"))
}

fn remove_path(path: &Path) -> Result<(), TrainingError> {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return Ok(());
    };
    removed.map_err(|err| {
        TrainingError::runtime(format!("failed to remove {}: {err}", path.display()))
    })
}

/// Swaps `staging` in for `target`. Until the new copy is in place the old
/// one stays on disk, either at `target` or at its retired path.
fn replace_dir(staging: &Path, target: &Path) -> Result<(), TrainingError> {
    let retired = retired_path(target);
    if target.exists() {
        remove_path(&retired)?;
        fs::rename(target, &retired).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to move {} aside: {err}",
                target.display()
            ))
        })?;
    }
    if let Err(err) = fs::rename(staging, target) {
        if retired.exists() {
            let _ = fs::rename(&retired, target);
        }
        return Err(TrainingError::runtime(format!(
            "failed to move {} to {}: {err}",
            staging.display(),
            target.display()
        )));
    }
    remove_path(&retired)
}

fn copy_files(from: &Path, to: &Path) -> Result<(), TrainingError> {
    let entries = fs::read_dir(from).map_err(|err| {
        TrainingError::runtime(format!("failed to read {}: {err}", from.display()))
    })?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name())).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to copy {}: {err}",
                    entry.path().display()
                ))
            })?;
        }
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path).map_err(|err| TrainingError::checkpoint(err.to_string()))?;
    if actual != expected_sha {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state(best_metric: f64) -> TrainingState {
        TrainingState {
            epoch: 0,
            arch: "linear".to_string(),
            model_state: HashMap::new(),
            optimizer_state: OptimizerState {
                step: 0,
                learning_rate: 0.1,
                momentum: 0.9,
                weight_decay: 1e-4,
                parameters: Vec::new(),
            },
            scheduler_state: SchedulerState {
                kind: "step".to_string(),
                last_epoch: 0,
                base_lr: 0.1,
                current_lr: 0.1,
            },
            best_metric,
        }
    }

    #[test]
    fn best_metric_never_decreases() {
        let mut state = empty_state(0.0);
        assert!(state.observe(55.2));
        assert!(!state.observe(50.0));
        assert_eq!(state.best_metric, 55.2);
        assert!(!state.observe(55.2));
        assert!(state.observe(60.0));
        assert_eq!(state.best_metric, 60.0);
    }

    #[test]
    fn resume_starts_after_the_saved_epoch() {
        let mut state = empty_state(0.0);
        state.epoch = 5;
        assert_eq!(state.resume_epoch(), 6);
    }

    #[test]
    fn non_coordinators_skip_saving() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig {
            directory: dir.path().to_path_buf(),
            ..CheckpointConfig::default()
        };
        let ctx = DistributedContext::new(1, 2, crate::distributed::Backend::InProcess).unwrap();
        let manager = CheckpointManager::new(&config, &ctx, "abc", None);
        assert_eq!(manager.save(&empty_state(1.0), true).unwrap(), SaveOutcome::Skipped);
        assert!(!manager.latest_path().exists());
    }

    #[test]
    fn missing_checkpoint_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(
            &CheckpointConfig::default(),
            &DistributedContext::single(),
            "abc",
            None,
        );
        assert!(manager.load(&dir.path().join("nope")).unwrap().is_none());
    }

    fn write_marker(dir: &Path, contents: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("marker"), contents).unwrap();
    }

    #[test]
    fn replacing_keeps_one_copy_on_disk_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("checkpoint");
        let staging = dir.path().join(".checkpoint.partial");
        let retired = dir.path().join(".checkpoint.old");
        assert_eq!(retired_path(&target), retired);

        write_marker(&target, "old");
        write_marker(&staging, "new");
        replace_dir(&staging, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("marker")).unwrap(), "new");
        assert!(!staging.exists());
        assert!(!retired.exists());

        // an interrupted swap left only the retired copy behind
        fs::rename(&target, &retired).unwrap();
        write_marker(&staging, "newer");
        replace_dir(&staging, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("marker")).unwrap(), "newer");
        assert!(!retired.exists());
    }

    #[test]
    fn failed_swap_restores_the_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("checkpoint");
        write_marker(&target, "old");

        let err = replace_dir(&dir.path().join("missing"), &target).unwrap_err();
        assert!(matches!(err, TrainingError::Runtime(_)), "{err}");
        assert_eq!(fs::read_to_string(target.join("marker")).unwrap(), "old");
        assert!(!retired_path(&target).exists());
    }

    #[test]
    fn plain_file_is_a_malformed_checkpoint() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let manager = CheckpointManager::new(
            &CheckpointConfig::default(),
            &DistributedContext::single(),
            "abc",
            None,
        );
        assert!(matches!(
            manager.load(file.path()),
            Err(TrainingError::Checkpoint(_))
        ));
    }
}
