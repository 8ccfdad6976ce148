//! Rank-aware batch samplers.
//!
//! * **[`ResumableBatchSampler`]**: infinite, epoch-spanning training order.
//!   Every rank derives the same per-epoch permutation from
//!   `seed + epoch`, takes its own contiguous slice of each global batch, and
//!   can be positioned at any `(epoch, iteration)` in O(1).
//! * **[`eval_partition`]**: contiguous validation split per rank.

use std::ops::Range;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, TrainError};

/// Static parameters of a [`ResumableBatchSampler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    pub dataset_len: usize,
    pub global_batch_size: usize,
    pub world_size: usize,
    pub rank: usize,
    /// Shared by all ranks; the epoch is added to it.
    pub seed: u64,
    pub shuffle: bool,
    /// Pad the final short batch of an epoch with the head of the next one.
    pub fill_last: bool,
}

/// One rank's share of one global batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub epoch: usize,
    pub iteration: usize,
    pub rank: usize,
    pub indices: Vec<usize>,
}

/// Restartable, rank-partitioned sampler over an unbounded sequence of epochs.
///
/// `position()` is always the batch that the next call to `next()` yields.
#[derive(Debug, Clone)]
pub struct ResumableBatchSampler {
    cfg: SamplerConfig,
    local_batch: usize,
    iters_per_epoch: usize,
    epoch: usize,
    iteration: usize,
    // The two permutations the current batch can touch.
    cache: Vec<(usize, Arc<Vec<usize>>)>,
}

impl ResumableBatchSampler {
    pub fn new(cfg: SamplerConfig, start_epoch: usize, start_iteration: usize) -> Result<Self> {
        if cfg.world_size == 0 || cfg.rank >= cfg.world_size {
            return Err(TrainError::config(format!(
                "rank {} is outside world of size {}",
                cfg.rank, cfg.world_size
            )));
        }
        if cfg.global_batch_size == 0 || cfg.global_batch_size % cfg.world_size != 0 {
            return Err(TrainError::config(format!(
                "global batch size {} is not divisible by world size {}",
                cfg.global_batch_size, cfg.world_size
            )));
        }
        if cfg.dataset_len == 0 {
            return Err(TrainError::config("cannot sample from an empty dataset"));
        }
        let iters_per_epoch = if cfg.fill_last {
            cfg.dataset_len.div_ceil(cfg.global_batch_size)
        } else {
            cfg.dataset_len / cfg.global_batch_size
        };
        if iters_per_epoch == 0 {
            return Err(TrainError::config(format!(
                "dataset of {} samples holds no full batch of {} (enable fill_last)",
                cfg.dataset_len, cfg.global_batch_size
            )));
        }
        let mut sampler = Self {
            local_batch: cfg.global_batch_size / cfg.world_size,
            iters_per_epoch,
            epoch: 0,
            iteration: 0,
            cache: Vec::with_capacity(2),
            cfg,
        };
        sampler.seek(start_epoch, start_iteration);
        Ok(sampler)
    }

    pub fn iters_per_epoch(&self) -> usize {
        self.iters_per_epoch
    }

    pub fn local_batch_size(&self) -> usize {
        self.local_batch
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.cfg
    }

    /// `(epoch, iteration)` of the next batch.
    pub fn position(&self) -> (usize, usize) {
        (self.epoch, self.iteration)
    }

    /// Jump to an arbitrary position. Iterations past the epoch end roll over.
    pub fn seek(&mut self, epoch: usize, iteration: usize) {
        self.epoch = epoch + iteration / self.iters_per_epoch;
        self.iteration = iteration % self.iters_per_epoch;
    }

    /// Start of a new epoch. A position already inside `epoch` is kept so a
    /// mid-epoch resume is not rewound.
    pub fn set_epoch(&mut self, epoch: usize) {
        if self.epoch != epoch {
            self.seek(epoch, 0);
        }
    }

    /// The sample order of `epoch`.
    pub fn epoch_order(&mut self, epoch: usize) -> Arc<Vec<usize>> {
        if let Some((_, order)) = self.cache.iter().find(|(e, _)| *e == epoch) {
            return Arc::clone(order);
        }
        let order = Arc::new(permutation(
            self.cfg.dataset_len,
            self.cfg.seed.wrapping_add(epoch as u64),
            self.cfg.shuffle,
        ));
        self.cache.retain(|(e, _)| *e + 1 >= epoch);
        if self.cache.len() >= 2 {
            self.cache.remove(0);
        }
        self.cache.push((epoch, Arc::clone(&order)));
        order
    }

    /// All indices of one global batch, across every rank.
    pub fn global_batch(&mut self, epoch: usize, iteration: usize) -> Vec<usize> {
        let g = self.cfg.global_batch_size;
        let len = self.cfg.dataset_len;
        let start = iteration * g;
        let mut out = Vec::with_capacity(g);

        let order = self.epoch_order(epoch);
        out.extend_from_slice(&order[start.min(len)..(start + g).min(len)]);

        // Only reachable with fill_last: wrap into the following epochs.
        let mut next = epoch + 1;
        while out.len() < g {
            let order = self.epoch_order(next);
            let need = (g - out.len()).min(len);
            out.extend_from_slice(&order[..need]);
            next += 1;
        }
        out
    }

    /// This rank's indices of one global batch.
    pub fn local_batch(&mut self, epoch: usize, iteration: usize) -> Vec<usize> {
        let global = self.global_batch(epoch, iteration);
        let begin = self.cfg.rank * self.local_batch;
        global[begin..begin + self.local_batch].to_vec()
    }
}

impl Iterator for ResumableBatchSampler {
    type Item = BatchDescriptor;

    fn next(&mut self) -> Option<BatchDescriptor> {
        let (epoch, iteration) = (self.epoch, self.iteration);
        let indices = self.local_batch(epoch, iteration);
        self.seek(epoch, iteration + 1);
        Some(BatchDescriptor {
            epoch,
            iteration,
            rank: self.cfg.rank,
            indices,
        })
    }
}

fn permutation(len: usize, seed: u64, shuffle: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    order
}

// ── Evaluation split ────────────────────────────────────────────────────────

/// Contiguous slice of `[0, len)` evaluated by `rank`.
///
/// Boundaries are `floor(i * len / world_size)`, so slices differ in size by
/// at most one and their union is the whole set.
pub fn eval_partition(len: usize, world_size: usize, rank: usize) -> Range<usize> {
    let world = world_size.max(1);
    let bound = |i: usize| (i * len) / world;
    bound(rank)..bound(rank + 1)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn cfg(len: usize, g: usize, world: usize, rank: usize, fill_last: bool) -> SamplerConfig {
        SamplerConfig {
            dataset_len: len,
            global_batch_size: g,
            world_size: world,
            rank,
            seed: 7,
            shuffle: true,
            fill_last,
        }
    }

    #[test]
    fn rejects_indivisible_batch() {
        let err = ResumableBatchSampler::new(cfg(100, 10, 4, 0, true), 0, 0).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn rejects_bad_rank_and_tiny_dataset() {
        assert!(ResumableBatchSampler::new(cfg(100, 8, 4, 4, true), 0, 0).is_err());
        assert!(ResumableBatchSampler::new(cfg(5, 8, 4, 0, false), 0, 0).is_err());
        assert!(ResumableBatchSampler::new(cfg(5, 8, 4, 0, true), 0, 0).is_ok());
    }

    #[test]
    fn ranks_partition_each_global_batch() {
        let world = 4;
        let mut samplers: Vec<_> = (0..world)
            .map(|r| ResumableBatchSampler::new(cfg(103, 12, world, r, true), 0, 0).unwrap())
            .collect();
        let ipe = samplers[0].iters_per_epoch();
        assert_eq!(ipe, 9);
        for _ in 0..ipe * 2 {
            let batches: Vec<BatchDescriptor> =
                samplers.iter_mut().map(|s| s.next().unwrap()).collect();
            let (e, i) = (batches[0].epoch, batches[0].iteration);
            let global = samplers[0].global_batch(e, i);

            let mut union = Vec::new();
            let mut seen = HashSet::new();
            for b in &batches {
                assert_eq!(b.indices.len(), 3);
                assert_eq!((b.epoch, b.iteration), (e, i));
                for &idx in &b.indices {
                    assert!(seen.insert(idx), "index {idx} assigned to two ranks");
                }
                union.extend_from_slice(&b.indices);
            }
            assert_eq!(union, global);
        }
    }

    #[test]
    fn resume_matches_skip_ahead() {
        let c = cfg(50, 8, 2, 1, true);
        let ipe = ResumableBatchSampler::new(c.clone(), 0, 0).unwrap().iters_per_epoch();
        let (e, i) = (2, 3);

        let resumed: Vec<_> = ResumableBatchSampler::new(c.clone(), e, i)
            .unwrap()
            .take(20)
            .collect();
        let skipped: Vec<_> = ResumableBatchSampler::new(c, 0, 0)
            .unwrap()
            .skip(e * ipe + i)
            .take(20)
            .collect();
        assert_eq!(resumed, skipped);
        assert_eq!((resumed[0].epoch, resumed[0].iteration), (e, i));
    }

    #[test]
    fn epochs_cover_dataset_and_differ() {
        let mut s = ResumableBatchSampler::new(cfg(40, 8, 1, 0, false), 0, 0).unwrap();
        let first: Vec<usize> = (0..5).flat_map(|_| s.next().unwrap().indices).collect();
        let second: Vec<usize> = (0..5).flat_map(|_| s.next().unwrap().indices).collect();
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..40).collect::<Vec<_>>());
        assert_ne!(first, second);
    }

    #[test]
    fn fill_last_wraps_into_next_epoch() {
        let mut s = ResumableBatchSampler::new(cfg(10, 4, 1, 0, true), 0, 0).unwrap();
        assert_eq!(s.iters_per_epoch(), 3);
        let last = s.global_batch(0, 2);
        let order0 = s.epoch_order(0);
        let order1 = s.epoch_order(1);
        assert_eq!(&last[..2], &order0[8..10]);
        assert_eq!(&last[2..], &order1[..2]);
    }

    #[test]
    fn drop_last_without_fill() {
        let mut s = ResumableBatchSampler::new(cfg(10, 4, 1, 0, false), 0, 0).unwrap();
        assert_eq!(s.iters_per_epoch(), 2);
        s.next();
        s.next();
        assert_eq!(s.position(), (1, 0));
    }

    #[test]
    fn set_epoch_keeps_mid_epoch_resume() {
        let mut s = ResumableBatchSampler::new(cfg(64, 8, 2, 0, true), 3, 5).unwrap();
        s.set_epoch(3);
        assert_eq!(s.position(), (3, 5));
        s.set_epoch(4);
        assert_eq!(s.position(), (4, 0));
    }

    #[test]
    fn unshuffled_order_is_identity() {
        let mut c = cfg(12, 4, 2, 1, true);
        c.shuffle = false;
        let mut s = ResumableBatchSampler::new(c, 0, 0).unwrap();
        assert_eq!(s.next().unwrap().indices, vec![2, 3]);
        assert_eq!(s.next().unwrap().indices, vec![6, 7]);
    }

    #[test]
    fn eval_partition_covers_set() {
        let parts: Vec<_> = (0..3).map(|r| eval_partition(10, 3, r)).collect();
        assert_eq!(parts, vec![0..3, 3..6, 6..10]);
        assert_eq!(eval_partition(7, 1, 0), 0..7);
    }
}
