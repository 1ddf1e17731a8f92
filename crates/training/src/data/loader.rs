use std::{
    ops::Range,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};

use super::{Batch, Dataset, Result};
use crate::{distributed::launch::panic_message, error::to_runtime_error, TrainingError};

/// Host-side batch before it is moved to the execution device.
struct HostBatch {
    features: Vec<f32>,
    labels: Vec<u32>,
    origin: Range<usize>,
}

fn collate(dataset: &dyn Dataset, indices: &[usize], origin: Range<usize>) -> Result<HostBatch> {
    let mut features = Vec::with_capacity(origin.len() * dataset.feature_dim());
    let mut labels = Vec::with_capacity(origin.len());
    for &index in &indices[origin.clone()] {
        let sample = dataset.get(index)?;
        features.extend_from_slice(&sample.features);
        labels.push(sample.label);
    }
    Ok(HostBatch {
        features,
        labels,
        origin,
    })
}

/// Batches one index list in order.
///
/// With `workers > 0` samples are gathered on a background thread that stays
/// up to `workers` batches ahead of the consumer.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    indices: Arc<[usize]>,
    batch_size: usize,
    workers: usize,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        indices: Vec<usize>,
        batch_size: usize,
        workers: usize,
        device: Device,
    ) -> Self {
        Self {
            dataset,
            indices: indices.into(),
            batch_size: batch_size.max(1),
            workers,
            device,
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Identifier of the sample at `position` in the index list.
    pub fn sample_id(&self, position: usize) -> Option<String> {
        self.indices
            .get(position)
            .map(|&index| self.dataset.sample_id(index))
    }

    pub fn iter(&self) -> BatchIter {
        let ranges = batch_ranges(self.indices.len(), self.batch_size);
        let expected = ranges.len();
        let source = if self.workers == 0 {
            Source::Inline {
                dataset: Arc::clone(&self.dataset),
                indices: Arc::clone(&self.indices),
                ranges,
            }
        } else {
            let (sender, receiver) = mpsc::sync_channel(self.workers);
            let dataset = Arc::clone(&self.dataset);
            let indices = Arc::clone(&self.indices);
            let spawned = thread::Builder::new()
                .name("data-loader".to_string())
                .spawn(move || {
                    for range in ranges {
                        let batch = collate(dataset.as_ref(), &indices[..], range);
                        let failed = batch.is_err();
                        // the consumer hung up
                        if sender.send(batch).is_err() || failed {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(handle) => Source::Prefetch {
                    receiver: Some(receiver),
                    handle: Some(handle),
                    expected,
                    received: 0,
                },
                Err(err) => Source::Failed(Some(TrainingError::runtime(format!(
                    "failed to start data loader thread: {err}"
                )))),
            }
        };
        BatchIter {
            source,
            device: self.device.clone(),
        }
    }
}

fn batch_ranges(len: usize, batch_size: usize) -> std::vec::IntoIter<Range<usize>> {
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect::<Vec<_>>()
        .into_iter()
}

enum Source {
    Inline {
        dataset: Arc<dyn Dataset>,
        indices: Arc<[usize]>,
        ranges: std::vec::IntoIter<Range<usize>>,
    },
    Prefetch {
        receiver: Option<Receiver<Result<HostBatch>>>,
        handle: Option<JoinHandle<()>>,
        expected: usize,
        received: usize,
    },
    Failed(Option<TrainingError>),
}

/// Iterator over the batches of one [`DataLoader`] pass.
pub struct BatchIter {
    source: Source,
    device: Device,
}

impl BatchIter {
    fn upload(&self, host: HostBatch) -> Result<Batch> {
        let rows = host.labels.len();
        let feature_dim = if rows == 0 { 0 } else { host.features.len() / rows };
        let inputs = Tensor::from_vec(host.features, (rows, feature_dim), &self.device)
            .map_err(to_runtime_error)?;
        let targets = Tensor::from_vec(host.labels, rows, &self.device).map_err(to_runtime_error)?;
        Ok(Batch {
            inputs,
            targets,
            origin: host.origin,
        })
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let host = match &mut self.source {
            Source::Inline {
                dataset,
                indices,
                ranges,
            } => {
                let range = ranges.next()?;
                collate(dataset.as_ref(), &indices[..], range)
            }
            Source::Prefetch {
                receiver,
                handle,
                expected,
                received,
            } => {
                let message = receiver.as_ref()?.recv();
                match message {
                    Ok(host) => {
                        *received += 1;
                        if host.is_err() {
                            // the producer stops after a failed batch
                            receiver.take();
                            if let Some(handle) = handle.take() {
                                let _ = handle.join();
                            }
                        }
                        host
                    }
                    Err(_) => {
                        receiver.take();
                        let joined = handle.take().map(JoinHandle::join);
                        return short_read(joined, *received, *expected).map(Err);
                    }
                }
            }
            Source::Failed(err) => return err.take().map(Err),
        };
        Some(host.and_then(|host| self.upload(host)))
    }
}

/// Error for a prefetch channel that closed before every batch arrived.
fn short_read(
    joined: Option<thread::Result<()>>,
    received: usize,
    expected: usize,
) -> Option<TrainingError> {
    match joined {
        Some(Err(payload)) => Some(TrainingError::runtime(format!(
            "data loader thread panicked after {received} of {expected} batches: {}",
            panic_message(payload.as_ref())
        ))),
        _ if received < expected => Some(TrainingError::runtime(format!(
            "data loader stopped after {received} of {expected} batches"
        ))),
        _ => None,
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let Source::Prefetch {
            receiver, handle, ..
        } = &mut self.source
        {
            receiver.take();
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticDataset;

    fn loader(workers: usize) -> DataLoader {
        let dataset: Arc<dyn Dataset> = Arc::new(SyntheticDataset::new(20, 3, 5, 1));
        DataLoader::new(dataset, vec![9, 3, 4, 0, 1, 2, 7], 3, workers, Device::Cpu)
    }

    #[test]
    fn batches_cover_the_index_list_in_order() {
        for workers in [0, 2] {
            let loader = loader(workers);
            assert_eq!(loader.num_batches(), 3);
            let origins: Vec<_> = loader.iter().map(|batch| batch.unwrap().origin).collect();
            assert_eq!(origins, vec![0..3, 3..6, 6..7]);
        }
    }

    #[test]
    fn batch_rows_match_dataset_samples() {
        let loader = loader(1);
        let dataset = SyntheticDataset::new(20, 3, 5, 1);
        let batch = loader.iter().next().unwrap().unwrap();
        assert_eq!(batch.inputs.dims(), &[3, 3]);
        let targets = batch.targets.to_vec1::<u32>().unwrap();
        let expected: Vec<u32> = [9, 3, 4].iter().map(|&i| dataset.get(i).unwrap().label).collect();
        assert_eq!(targets, expected);
        assert_eq!(loader.sample_id(0).as_deref(), Some("fake_9"));
        assert_eq!(loader.sample_id(7), None);
    }

    struct Flaky {
        inner: SyntheticDataset,
        panic_at: usize,
    }

    impl Dataset for Flaky {
        fn len(&self) -> usize {
            self.inner.len()
        }

        fn feature_dim(&self) -> usize {
            self.inner.feature_dim()
        }

        fn num_classes(&self) -> usize {
            self.inner.num_classes()
        }

        fn get(&self, index: usize) -> Result<crate::data::Sample> {
            if index == self.panic_at {
                panic!("sample {index} is unreadable");
            }
            self.inner.get(index)
        }

        fn sample_id(&self, index: usize) -> String {
            self.inner.sample_id(index)
        }
    }

    #[test]
    fn a_panicking_prefetcher_fails_the_pass() {
        let dataset: Arc<dyn Dataset> = Arc::new(Flaky {
            inner: SyntheticDataset::new(20, 3, 5, 1),
            panic_at: 12,
        });
        let loader = DataLoader::new(dataset, (0..20).collect(), 5, 1, Device::Cpu);
        let results: Vec<_> = loader.iter().collect();
        // two good batches, then the panic surfaces once
        assert_eq!(results.len(), 3);
        assert!(results[..2].iter().all(|batch| batch.is_ok()));
        match &results[2] {
            Err(TrainingError::Runtime(message)) => {
                assert!(message.contains("panicked after 2 of 4 batches"), "{message}");
                assert!(message.contains("sample 12 is unreadable"), "{message}");
            }
            other => panic!("expected a runtime error, got {:?}", other.as_ref().map(|b| b.origin.clone())),
        }
    }

    #[test]
    fn a_complete_prefetch_pass_ends_cleanly() {
        let loader = loader(2);
        let mut iter = loader.iter();
        assert_eq!(iter.by_ref().filter(|batch| batch.is_ok()).count(), 3);
        assert!(iter.next().is_none());
    }

    #[test]
    fn dropping_an_iterator_early_stops_the_prefetcher() {
        let loader = loader(1);
        let mut iter = loader.iter();
        assert!(iter.next().is_some());
        drop(iter);
    }
}
