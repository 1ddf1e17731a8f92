pub mod annotations;
pub mod loader;
pub mod sampler;

use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufRead, BufReader},
    ops::Range,
    path::Path,
    sync::Arc,
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

use crate::{config::DataConfig, distributed::DistributedContext, TrainingError};

pub use annotations::ValAnnotations;
pub use loader::{BatchIter, DataLoader};
pub use sampler::DistributedSampler;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One labelled feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub features: Vec<f32>,
    pub label: u32,
}

/// Random-access source of samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn feature_dim(&self) -> usize;

    fn num_classes(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sample>;

    /// Stable identifier written to misclassification reports.
    fn sample_id(&self, index: usize) -> String;
}

/// A collated batch on the execution device.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, feature_dim]`
    pub inputs: Tensor,
    /// `[batch]`, `u32` class indices
    pub targets: Tensor,
    /// Positions of these rows within the loader's index list.
    pub origin: Range<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.origin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origin.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
    features: Vec<f32>,
    #[serde(default)]
    label: Option<String>,
}

/// Feature vectors held in memory, loaded from JSON lines
/// (`{"id": .., "features": [..], "label": ..}`).
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    ids: Vec<String>,
    features: Vec<Vec<f32>>,
    labels: Vec<Option<u32>>,
    classes: Vec<String>,
    feature_dim: usize,
}

impl InMemoryDataset {
    /// Without `classes`, the class list is the sorted set of labels in the file.
    pub fn load_jsonl(path: &Path, classes: Option<&[String]>) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open dataset {}: {err}",
                path.display()
            ))
        })?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|err| {
                TrainingError::initialization(format!(
                    "{}:{}: invalid record: {err}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            records.push(record);
        }

        let classes = match classes {
            Some(classes) => classes.to_vec(),
            None => records
                .iter()
                .filter_map(|record| record.label.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        Self::from_records(records, classes)
            .map_err(|err| match err {
                TrainingError::Initialization(msg) => {
                    TrainingError::initialization(format!("{}: {msg}", path.display()))
                }
                other => other,
            })
    }

    fn from_records(records: Vec<Record>, classes: Vec<String>) -> Result<Self> {
        let feature_dim = records.first().map(|r| r.features.len()).unwrap_or(0);
        let mut dataset = Self {
            ids: Vec::with_capacity(records.len()),
            features: Vec::with_capacity(records.len()),
            labels: Vec::with_capacity(records.len()),
            classes,
            feature_dim,
        };
        for record in records {
            if record.features.len() != feature_dim {
                return Err(TrainingError::initialization(format!(
                    "record {} has {} features, expected {feature_dim}",
                    record.id,
                    record.features.len()
                )));
            }
            let label = match record.label {
                Some(tag) => Some(dataset.class_index(&tag).ok_or_else(|| {
                    TrainingError::label_mapping(format!(
                        "label '{tag}' of sample {} is not a known class",
                        record.id
                    ))
                })?),
                None => None,
            };
            dataset.ids.push(record.id);
            dataset.features.push(record.features);
            dataset.labels.push(label);
        }
        Ok(dataset)
    }

    fn class_index(&self, tag: &str) -> Option<u32> {
        self.classes
            .iter()
            .position(|class| class == tag)
            .map(|index| index as u32)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Replaces every label with the one the annotation table assigns.
    pub fn relabel(&mut self, annotations: &ValAnnotations) -> Result<()> {
        for (id, label) in self.ids.iter().zip(self.labels.iter_mut()) {
            *label = Some(annotations.label_for(id, &self.classes)?);
        }
        Ok(())
    }

    pub fn ensure_labeled(&self) -> Result<()> {
        match self.labels.iter().position(Option::is_none) {
            Some(index) => Err(TrainingError::label_mapping(format!(
                "sample {} has no label",
                self.ids[index]
            ))),
            None => Ok(()),
        }
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let features = self.features.get(index).ok_or_else(|| {
            TrainingError::runtime(format!(
                "sample index {index} out of range for {} samples",
                self.ids.len()
            ))
        })?;
        let label = self.labels[index].ok_or_else(|| {
            TrainingError::label_mapping(format!("sample {} has no label", self.ids[index]))
        })?;
        Ok(Sample {
            features: features.clone(),
            label,
        })
    }

    fn sample_id(&self, index: usize) -> String {
        self.ids
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("#{index}"))
    }
}

/// Deterministic stand-in data for benchmarking the pipeline.
///
/// Every index always yields the same sample. Labels are uniform; features
/// are noise plus a class-dependent offset so the task is learnable.
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    len: usize,
    feature_dim: usize,
    num_classes: usize,
    seed: u64,
}

impl SyntheticDataset {
    pub fn new(len: usize, feature_dim: usize, num_classes: usize, seed: u64) -> Self {
        Self {
            len,
            feature_dim,
            num_classes,
            seed,
        }
    }
}

impl Dataset for SyntheticDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.len {
            return Err(TrainingError::runtime(format!(
                "sample index {index} out of range for {} samples",
                self.len
            )));
        }
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let label = rng.gen_range(0..self.num_classes) as u32;
        let mut features: Vec<f32> = (0..self.feature_dim)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        features[label as usize % self.feature_dim] += 4.0;
        Ok(Sample { features, label })
    }

    fn sample_id(&self, index: usize) -> String {
        format!("fake_{index}")
    }
}

/// One rank's view of a dataset: the sampler shard plus loader settings.
pub struct Partition {
    dataset: Arc<dyn Dataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    workers: usize,
}

impl Partition {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        context: &DistributedContext,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
        batch_size: usize,
        workers: usize,
    ) -> Self {
        let sampler = DistributedSampler::new(dataset.len(), context, shuffle, drop_last, seed);
        Self {
            dataset,
            sampler,
            batch_size,
            workers,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    pub fn sampler(&self) -> &DistributedSampler {
        &self.sampler
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Loader over this rank's shard for the current epoch.
    pub fn loader(&self, device: &Device) -> DataLoader {
        DataLoader::new(
            Arc::clone(&self.dataset),
            self.sampler.indices(),
            self.batch_size,
            self.workers,
            device.clone(),
        )
    }

    /// Loader over this rank's slice of the samples no shard covers, if any.
    pub fn remainder_loader(&self, device: &Device) -> Option<DataLoader> {
        let indices = self.sampler.remainder_shard();
        if indices.is_empty() {
            return None;
        }
        Some(DataLoader::new(
            Arc::clone(&self.dataset),
            indices,
            self.batch_size,
            self.workers,
            device.clone(),
        ))
    }
}

/// Training and validation datasets described by `config`.
pub fn build_datasets(
    config: &DataConfig,
    seed: Option<u64>,
) -> Result<(Arc<dyn Dataset>, Arc<dyn Dataset>)> {
    if let Some(dummy) = &config.dummy {
        log::info!(
            "using synthetic data: {} train / {} validation samples",
            dummy.train_size,
            dummy.val_size
        );
        let seed = seed.unwrap_or(0);
        let train = SyntheticDataset::new(
            dummy.train_size,
            dummy.feature_dim,
            dummy.num_classes,
            seed,
        );
        let validation = SyntheticDataset::new(
            dummy.val_size,
            dummy.feature_dim,
            dummy.num_classes,
            seed.wrapping_add(1),
        );
        return Ok((Arc::new(train), Arc::new(validation)));
    }

    let train_path = config
        .train
        .as_deref()
        .ok_or_else(|| TrainingError::initialization("data.train is not set"))?;
    let validation_path = config
        .validation
        .as_deref()
        .ok_or_else(|| TrainingError::initialization("data.validation is not set"))?;

    let train = InMemoryDataset::load_jsonl(train_path, None)?;
    train.ensure_labeled()?;
    let mut validation = InMemoryDataset::load_jsonl(validation_path, Some(train.classes()))?;
    if let Some(path) = &config.val_annotations {
        validation.relabel(&ValAnnotations::load(path)?)?;
    }
    validation.ensure_labeled()?;

    if train.is_empty() || validation.is_empty() {
        return Err(TrainingError::initialization(
            "training and validation datasets must not be empty",
        ));
    }
    if train.feature_dim() != validation.feature_dim() {
        return Err(TrainingError::initialization(format!(
            "train features have {} dimensions but validation features have {}",
            train.feature_dim(),
            validation.feature_dim()
        )));
    }
    log::info!(
        "loaded {} train / {} validation samples over {} classes",
        train.len(),
        validation.len(),
        train.num_classes()
    );
    Ok((Arc::new(train), Arc::new(validation)))
}
