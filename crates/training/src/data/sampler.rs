use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::distributed::DistributedContext;

/// Splits dataset positions across ranks, reshuffled per epoch.
///
/// With `drop_last` each rank receives `len / world_size` samples and the tail
/// that does not divide evenly is exposed through [`remainder`](Self::remainder).
/// Without it the index list is padded cyclically so every rank receives
/// `ceil(len / world_size)` samples.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: u64,
    num_samples: usize,
    total_size: usize,
}

impl DistributedSampler {
    pub fn new(
        len: usize,
        context: &DistributedContext,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
    ) -> Self {
        let world_size = context.world_size();
        let num_samples = if drop_last && len % world_size != 0 {
            len / world_size
        } else {
            len.div_ceil(world_size)
        };
        Self {
            len,
            rank: context.rank(),
            world_size,
            shuffle,
            drop_last,
            seed,
            epoch: 0,
            num_samples,
            total_size: num_samples * world_size,
        }
    }

    /// Changes the shuffle permutation. Every rank must use the same epoch.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch as u64;
    }

    pub fn epoch(&self) -> usize {
        self.epoch as usize
    }

    pub fn dataset_len(&self) -> usize {
        self.len
    }

    /// Samples assigned to this rank per epoch.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Samples covered by all shards together.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn drop_last(&self) -> bool {
        self.drop_last
    }

    fn order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        if !self.drop_last && self.len > 0 {
            let mut cursor = 0;
            while order.len() < self.total_size {
                order.push(order[cursor % self.len]);
                cursor += 1;
            }
        }
        order
    }

    /// Dataset positions for this rank, in iteration order.
    pub fn indices(&self) -> Vec<usize> {
        self.order()
            .into_iter()
            .take(self.total_size)
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Positions `[total_size, len)` that no shard covers. Empty without `drop_last`.
    pub fn remainder(&self) -> Vec<usize> {
        if !self.drop_last {
            return Vec::new();
        }
        self.order().into_iter().skip(self.total_size).collect()
    }

    /// The slice of the remainder this rank evaluates: remainder entry `i`
    /// belongs to rank `i % world_size`.
    pub fn remainder_shard(&self) -> Vec<usize> {
        self.remainder()
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
