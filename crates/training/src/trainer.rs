use std::{sync::Arc, time::Instant};

use candle_core::Device;
use model::Model;

use crate::{
    config::RuntimeConfig,
    data::Partition,
    distributed::{grad_sync, Collective},
    error::to_runtime_error,
    logging::TelemetrySink,
    loss::{CrossEntropyLoss, LossOutput},
    metrics::{accuracy, AverageMeter, MeterFormat, Summary, WindowAverage},
    optimizer::Sgd,
    progress::ProgressMeter,
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub print_freq: usize,
    pub telemetry_every: usize,
    pub topk: Vec<usize>,
    /// Print progress lines to stdout.
    pub echo: bool,
}

impl TrainerSettings {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            print_freq: runtime.print_freq.max(1),
            telemetry_every: runtime.telemetry_every.max(1),
            topk: runtime.topk.clone(),
            echo: runtime.logging.enable_stdout,
        }
    }
}

/// This rank's view of one training epoch. Not reduced across ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub loss: f64,
    /// `(k, top-k accuracy in percent)` for each configured `k`.
    pub accuracy: Vec<(usize, f64)>,
    pub samples: usize,
    pub batches: usize,
    pub elapsed_secs: f64,
}

impl EpochSummary {
    pub fn accuracy_at(&self, k: usize) -> Option<f64> {
        self.accuracy
            .iter()
            .find(|(candidate, _)| *candidate == k)
            .map(|(_, value)| *value)
    }
}

pub(crate) fn accuracy_meters(topk: &[usize], summary: Summary) -> Vec<AverageMeter> {
    topk.iter()
        .map(|k| {
            AverageMeter::new(
                format!("Acc@{k}"),
                MeterFormat::Fixed {
                    width: 6,
                    precision: 2,
                },
                summary,
            )
        })
        .collect()
}

pub(crate) fn time_meter(name: &str) -> AverageMeter {
    AverageMeter::new(
        name,
        MeterFormat::Fixed {
            width: 6,
            precision: 3,
        },
        Summary::None,
    )
}

pub(crate) fn loss_meter(summary: Summary) -> AverageMeter {
    AverageMeter::new("Loss", MeterFormat::Scientific { precision: 4 }, summary)
}

/// Drives one epoch of data-parallel SGD over a rank's shard.
pub struct Trainer {
    device: Device,
    collective: Arc<dyn Collective>,
    settings: TrainerSettings,
    loss: CrossEntropyLoss,
}

impl Trainer {
    pub fn new(device: Device, collective: Arc<dyn Collective>, settings: TrainerSettings) -> Self {
        Self {
            device,
            collective,
            settings,
            loss: CrossEntropyLoss::new(),
        }
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    /// Every rank must call this with the same `epoch`; gradients are averaged
    /// across ranks before each optimizer step.
    pub fn train_epoch(
        &self,
        epoch: usize,
        model: &Model,
        optimizer: &mut Sgd,
        partition: &mut Partition,
        sink: &mut dyn TelemetrySink,
    ) -> Result<EpochSummary, TrainingError> {
        partition.set_epoch(epoch);
        model.set_training(true);

        let loader = partition.loader(&self.device);
        let num_batches = loader.num_batches();
        let progress = ProgressMeter::new(num_batches, format!("Epoch: [{epoch}]"));
        let parameters = model.parameters();

        let mut batch_time = time_meter("Time");
        let mut data_time = time_meter("Data");
        let mut losses = loss_meter(Summary::None);
        let mut accuracies = accuracy_meters(&self.settings.topk, Summary::Average);
        let mut loss_window = WindowAverage::default();
        let mut accuracy_windows = vec![WindowAverage::default(); self.settings.topk.len()];

        let started = Instant::now();
        let mut end = Instant::now();
        let mut batches = 0;
        for (i, batch) in loader.iter().enumerate() {
            let batch = batch?;
            data_time.update(end.elapsed().as_secs_f64(), 1);

            let logits = model.forward(&batch.inputs).map_err(to_runtime_error)?;
            let LossOutput { loss, value } = self.loss.compute(&logits, &batch.targets)?;
            let scores = accuracy(&logits, &batch.targets, &self.settings.topk)?;

            let mut grads = loss.backward().map_err(to_runtime_error)?;
            grad_sync::all_reduce_gradients(self.collective.as_ref(), &parameters, &mut grads)?;
            optimizer.step(&mut grads)?;

            let rows = batch.len();
            losses.update(value, rows);
            loss_window.record(value);
            for ((meter, window), score) in accuracies
                .iter_mut()
                .zip(accuracy_windows.iter_mut())
                .zip(&scores)
            {
                meter.update(*score, rows);
                window.record(*score);
            }

            batch_time.update(end.elapsed().as_secs_f64(), 1);
            end = Instant::now();
            batches += 1;

            if self.settings.echo && i % self.settings.print_freq == 0 {
                let mut meters = vec![&batch_time, &data_time, &losses];
                meters.extend(accuracies.iter());
                println!("{}", progress.display(i + 1, &meters));
            }

            if (i + 1) % self.settings.telemetry_every == 0 {
                let step = (epoch * num_batches + i) as u64;
                if let Some(mean) = loss_window.take() {
                    sink.emit_scalar("train/loss", mean, step)?;
                }
                for (k, window) in self.settings.topk.iter().zip(accuracy_windows.iter_mut()) {
                    if let Some(mean) = window.take() {
                        sink.emit_scalar(&format!("train/acc{k}"), mean, step)?;
                    }
                }
                sink.flush()?;
            }
        }

        Ok(EpochSummary {
            epoch,
            loss: losses.avg(),
            accuracy: self
                .settings
                .topk
                .iter()
                .copied()
                .zip(accuracies.iter().map(AverageMeter::avg))
                .collect(),
            samples: losses.count() as usize,
            batches,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::DType;
    use model::{Architecture, ModelConfig};

    use super::*;
    use crate::{
        data::{Dataset, SyntheticDataset},
        distributed::{DistributedContext, LocalCollective},
        optimizer::SgdConfig,
    };

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<(String, u64)>,
        flushes: usize,
    }

    impl TelemetrySink for RecordingSink {
        fn emit_scalar(&mut self, name: &str, _value: f64, step: u64) -> Result<(), TrainingError> {
            self.events.push((name.to_string(), step));
            Ok(())
        }

        fn flush(&mut self) -> Result<(), TrainingError> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn fixture() -> (Trainer, Model, Sgd, Partition) {
        let dataset: Arc<dyn Dataset> = Arc::new(SyntheticDataset::new(24, 4, 3, 9));
        let partition = Partition::new(dataset, &DistributedContext::single(), true, false, 5, 4, 0);
        let model = Model::new(ModelConfig {
            arch: Architecture::Linear,
            input_dim: 4,
            hidden_dim: 8,
            num_classes: 3,
            dtype: DType::F32,
            device: Device::Cpu,
            init_seed: 2,
        })
        .unwrap();
        let optimizer = Sgd::new(
            model.parameters(),
            SgdConfig {
                learning_rate: 0.05,
                momentum: 0.9,
                weight_decay: 0.0,
            },
        )
        .unwrap();
        let trainer = Trainer::new(
            Device::Cpu,
            Arc::new(LocalCollective),
            TrainerSettings {
                print_freq: 10,
                telemetry_every: 2,
                topk: vec![1, 2],
                echo: false,
            },
        );
        (trainer, model, optimizer, partition)
    }

    #[test]
    fn epoch_covers_the_shard_and_reports_windows() {
        let (trainer, model, mut optimizer, mut partition) = fixture();
        model.set_training(false);
        let mut sink = RecordingSink::default();

        let summary = trainer
            .train_epoch(1, &model, &mut optimizer, &mut partition, &mut sink)
            .unwrap();
        assert!(model.is_training());
        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.samples, partition.sampler().indices().len());
        assert_eq!(summary.samples, 24);
        assert_eq!(summary.batches, 6);
        assert!(summary.loss.is_finite());
        assert!(summary.accuracy_at(2).unwrap() >= summary.accuracy_at(1).unwrap());

        // six batches, a window of two: steps 1*6 + {1, 3, 5}
        let mut expected = Vec::new();
        for step in [7, 9, 11] {
            for name in ["train/loss", "train/acc1", "train/acc2"] {
                expected.push((name.to_string(), step));
            }
        }
        assert_eq!(sink.events, expected);
        assert_eq!(sink.flushes, 3);
    }

    #[test]
    fn each_epoch_reshuffles_and_replays_deterministically() {
        let (trainer, model, mut optimizer, mut partition) = fixture();
        let mut sink = RecordingSink::default();

        trainer
            .train_epoch(0, &model, &mut optimizer, &mut partition, &mut sink)
            .unwrap();
        let first = partition.sampler().indices();
        assert_eq!(partition.sampler().epoch(), 0);

        trainer
            .train_epoch(1, &model, &mut optimizer, &mut partition, &mut sink)
            .unwrap();
        let second = partition.sampler().indices();
        assert_eq!(partition.sampler().epoch(), 1);
        assert_ne!(first, second);

        let mut sorted = second.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..24).collect::<Vec<_>>());

        trainer
            .train_epoch(0, &model, &mut optimizer, &mut partition, &mut sink)
            .unwrap();
        assert_eq!(partition.sampler().indices(), first);
    }
}
