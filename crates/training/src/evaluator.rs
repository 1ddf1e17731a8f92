use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use candle_core::Device;
use model::Model;

use crate::{
    config::RuntimeConfig,
    data::{DataLoader, Partition},
    distributed::Collective,
    error::to_runtime_error,
    logging::TelemetrySink,
    loss::CrossEntropyLoss,
    metrics::{accuracy, predictions, AverageMeter, Summary},
    progress::ProgressMeter,
    trainer::{accuracy_meters, loss_meter, time_meter},
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    pub print_freq: usize,
    pub topk: Vec<usize>,
    pub echo: bool,
    pub loss_summary: Summary,
    pub accuracy_summary: Summary,
    /// Base path of the misclassification report; ranks above 0 append `.rank{r}`.
    pub misclassified_report: Option<PathBuf>,
}

impl EvaluationSettings {
    pub fn from_config(runtime: &RuntimeConfig) -> Result<Self, TrainingError> {
        Ok(Self {
            print_freq: runtime.print_freq.max(1),
            topk: runtime.topk.clone(),
            echo: runtime.logging.enable_stdout,
            loss_summary: runtime.evaluation.loss_summary.parse()?,
            accuracy_summary: runtime.evaluation.accuracy_summary.parse()?,
            misclassified_report: runtime.evaluation.misclassified_report.clone(),
        })
    }
}

/// Validation metrics reduced over every rank.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub epoch: Option<usize>,
    pub loss: f64,
    pub accuracy: Vec<(usize, f64)>,
    /// Samples evaluated by all ranks together.
    pub samples: usize,
    /// Misclassified samples seen by this rank.
    pub misclassified: usize,
}

impl EvaluationSummary {
    pub fn accuracy_at(&self, k: usize) -> Option<f64> {
        self.accuracy
            .iter()
            .find(|(candidate, _)| *candidate == k)
            .map(|(_, value)| *value)
    }

    /// Accuracy at the first configured `k`; the metric that selects the best checkpoint.
    pub fn primary_accuracy(&self) -> f64 {
        self.accuracy.first().map(|(_, value)| *value).unwrap_or(0.0)
    }
}

/// Identifiers of samples whose top-1 prediction missed, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MisclassificationReport {
    ids: Vec<String>,
}

impl MisclassificationReport {
    pub fn push(&mut self, id: impl Into<String>) {
        self.ids.push(id.into());
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Overwrites `path` with one identifier per line.
    pub fn write(&self, path: &Path) -> Result<(), TrainingError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        for id in &self.ids {
            writeln!(writer, "{id}")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Where `rank` writes its report given the configured base path.
    pub fn path_for_rank(base: &Path, rank: usize) -> PathBuf {
        if rank == 0 {
            return base.to_path_buf();
        }
        let mut name = base.as_os_str().to_owned();
        name.push(format!(".rank{rank}"));
        PathBuf::from(name)
    }
}

/// Per-pass meters; the auxiliary pass gets a fresh set that is folded into the main one.
struct PassMeters {
    batch_time: AverageMeter,
    losses: AverageMeter,
    accuracies: Vec<AverageMeter>,
}

impl PassMeters {
    fn new(settings: &EvaluationSettings) -> Self {
        Self {
            batch_time: time_meter("Time"),
            losses: loss_meter(settings.loss_summary),
            accuracies: accuracy_meters(&settings.topk, settings.accuracy_summary),
        }
    }

    fn absorb(&mut self, other: &PassMeters) {
        self.batch_time.absorb(&other.batch_time);
        self.losses.absorb(&other.losses);
        for (mine, theirs) in self.accuracies.iter_mut().zip(&other.accuracies) {
            mine.absorb(theirs);
        }
    }

    fn all(&self) -> Vec<&AverageMeter> {
        let mut meters = vec![&self.batch_time, &self.losses];
        meters.extend(self.accuracies.iter());
        meters
    }
}

/// Scores a model on the validation partition so that every sample counts exactly once.
pub struct Evaluator {
    device: Device,
    collective: Arc<dyn Collective>,
    rank: usize,
    settings: EvaluationSettings,
    loss: CrossEntropyLoss,
}

impl Evaluator {
    pub fn new(
        device: Device,
        collective: Arc<dyn Collective>,
        settings: EvaluationSettings,
    ) -> Self {
        let rank = collective.rank();
        Self {
            device,
            collective,
            rank,
            settings,
            loss: CrossEntropyLoss::new(),
        }
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    /// Runs the shard pass, then the auxiliary pass over this rank's slice of
    /// the samples no shard covers, and reduces loss and accuracies across ranks.
    ///
    /// The model's training flag is restored before returning, even on error.
    pub fn evaluate(
        &self,
        epoch: Option<usize>,
        model: &Model,
        partition: &Partition,
        sink: &mut dyn TelemetrySink,
    ) -> Result<EvaluationSummary, TrainingError> {
        let was_training = model.is_training();
        model.set_training(false);
        let result = self.evaluate_inner(epoch, model, partition, sink);
        model.set_training(was_training);
        result
    }

    fn evaluate_inner(
        &self,
        epoch: Option<usize>,
        model: &Model,
        partition: &Partition,
        sink: &mut dyn TelemetrySink,
    ) -> Result<EvaluationSummary, TrainingError> {
        let loader = partition.loader(&self.device);
        let auxiliary = partition.remainder_loader(&self.device);
        let has_remainder = !partition.sampler().remainder().is_empty();
        let progress = ProgressMeter::new(
            loader.num_batches() + usize::from(has_remainder),
            "Test: ",
        );

        let mut report = MisclassificationReport::default();
        let mut meters = PassMeters::new(&self.settings);
        self.run_pass(&loader, 0, model, &progress, &mut meters, &mut report)?;

        if let Some(auxiliary) = &auxiliary {
            let mut extra = PassMeters::new(&self.settings);
            self.run_pass(
                auxiliary,
                loader.num_batches(),
                model,
                &progress,
                &mut extra,
                &mut report,
            )?;
            meters.absorb(&extra);
        }

        let collective = self.collective.as_ref();
        meters.losses.reduce_across_processes(collective)?;
        for meter in &mut meters.accuracies {
            meter.reduce_across_processes(collective)?;
        }

        if self.settings.echo {
            println!("{}", progress.display_summary(&meters.all()));
        }

        if let Some(epoch) = epoch {
            let step = epoch as u64;
            sink.emit_scalar("val/loss", meters.losses.avg(), step)?;
            for (k, meter) in self.settings.topk.iter().zip(&meters.accuracies) {
                sink.emit_scalar(&format!("val/acc{k}"), meter.avg(), step)?;
            }
            sink.flush()?;
        }

        if let Some(base) = &self.settings.misclassified_report {
            let path = MisclassificationReport::path_for_rank(base, self.rank);
            report.write(&path)?;
            log::debug!(
                "wrote {} misclassified ids to {}",
                report.len(),
                path.display()
            );
        }

        Ok(EvaluationSummary {
            epoch,
            loss: meters.losses.avg(),
            accuracy: self
                .settings
                .topk
                .iter()
                .copied()
                .zip(meters.accuracies.iter().map(AverageMeter::avg))
                .collect(),
            samples: meters.losses.count() as usize,
            misclassified: report.len(),
        })
    }

    fn run_pass(
        &self,
        loader: &DataLoader,
        base_progress: usize,
        model: &Model,
        progress: &ProgressMeter,
        meters: &mut PassMeters,
        report: &mut MisclassificationReport,
    ) -> Result<(), TrainingError> {
        let num_classes = model.num_classes();
        let mut end = Instant::now();
        for (i, batch) in loader.iter().enumerate() {
            let batch = batch?;

            let labels = batch.targets.to_vec1::<u32>().map_err(to_runtime_error)?;
            if let Some((row, label)) = labels
                .iter()
                .enumerate()
                .find(|(_, label)| **label as usize >= num_classes)
            {
                let id = sample_id_at(loader, batch.origin.start + row)?;
                return Err(TrainingError::label_mapping(format!(
                    "sample {id} has label {label} but the model predicts {num_classes} classes"
                )));
            }

            let logits = model
                .forward(&batch.inputs)
                .map_err(to_runtime_error)?
                .detach();
            let output = self.loss.compute(&logits, &batch.targets)?;
            let scores = accuracy(&logits, &batch.targets, &self.settings.topk)?;

            for (row, (predicted, label)) in predictions(&logits)?.iter().zip(&labels).enumerate() {
                if predicted != label {
                    report.push(sample_id_at(loader, batch.origin.start + row)?);
                }
            }

            let rows = batch.len();
            meters.losses.update(output.value, rows);
            for (meter, score) in meters.accuracies.iter_mut().zip(&scores) {
                meter.update(*score, rows);
            }
            meters.batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();

            if self.settings.echo && i % self.settings.print_freq == 0 {
                println!("{}", progress.display(base_progress + i + 1, &meters.all()));
            }
        }
        Ok(())
    }
}

/// Identifier of the sample at `position` in the loader's index list.
fn sample_id_at(loader: &DataLoader, position: usize) -> Result<String, TrainingError> {
    loader.sample_id(position).ok_or_else(|| {
        TrainingError::label_mapping(format!(
            "batch position {position} is outside the loader's {} indices",
            loader.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, SyntheticDataset};

    #[test]
    fn positions_outside_the_index_list_are_a_mapping_error() {
        let dataset: Arc<dyn Dataset> = Arc::new(SyntheticDataset::new(10, 2, 3, 0));
        let loader = DataLoader::new(dataset, vec![4, 7, 1], 2, 0, Device::Cpu);
        assert_eq!(sample_id_at(&loader, 1).unwrap(), "fake_7");
        let err = sample_id_at(&loader, 3).unwrap_err();
        assert!(matches!(err, TrainingError::LabelMapping(_)), "{err}");
        assert!(err.to_string().contains("position 3"), "{err}");
    }

    #[test]
    fn rank_zero_keeps_the_base_report_path() {
        let base = Path::new("out/wrong.txt");
        assert_eq!(MisclassificationReport::path_for_rank(base, 0), base);
        assert_eq!(
            MisclassificationReport::path_for_rank(base, 3),
            PathBuf::from("out/wrong.txt.rank3")
        );
    }

    #[test]
    fn report_writes_one_id_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wrong.txt");
        let mut report = MisclassificationReport::default();
        report.push("val_3.JPEG");
        report.push("val_17.JPEG");
        report.write(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "val_3.JPEG\nval_17.JPEG\n"
        );

        MisclassificationReport::default().write(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn primary_accuracy_is_the_first_k() {
        let summary = EvaluationSummary {
            epoch: Some(2),
            loss: 1.0,
            accuracy: vec![(1, 55.2), (5, 80.0)],
            samples: 10,
            misclassified: 4,
        };
        assert_eq!(summary.primary_accuracy(), 55.2);
        assert_eq!(summary.accuracy_at(5), Some(80.0));
        assert_eq!(summary.accuracy_at(3), None);
    }
}
