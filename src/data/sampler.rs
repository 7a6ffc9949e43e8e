//! Per-rank sample selection
//!
//! `DistributedSampler` splits a dataset into `num_replicas` equally sized,
//! disjoint (up to padding) index lists:
//!
//! 1. shuffle `0..len` with a generator seeded by `seed + epoch` (same order on
//!    every rank)
//! 2. pad by repeating leading indices until the length is a multiple of
//!    `num_replicas`
//! 3. keep every `num_replicas`-th index starting at `rank`
//!
//! Call [`DistributedSampler::set_epoch`] before each epoch to reshuffle.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(len: usize, num_replicas: usize, rank: usize) -> Self {
        let num_replicas = num_replicas.max(1);
        assert!(rank < num_replicas, "rank {} out of range for {} replicas", rank, num_replicas);
        Self {
            len,
            num_replicas,
            rank,
            shuffle: true,
            seed: 0,
            epoch: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Samples this rank sees per epoch
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.num_replicas)
    }

    pub fn total_size(&self) -> usize {
        self.num_samples() * self.num_replicas
    }

    /// This rank's indices for the current epoch
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut all: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            all.shuffle(&mut rng);
        }

        let total = self.total_size();
        let mut i = 0;
        while all.len() < total {
            all.push(all[i]);
            i += 1;
        }

        all.into_iter().skip(self.rank).step_by(self.num_replicas).collect()
    }
}

/// Repeat `indices` in order until `count` entries are produced
pub fn cycle_to(indices: &[usize], count: usize) -> Vec<usize> {
    if indices.is_empty() {
        return Vec::new();
    }
    indices.iter().copied().cycle().take(count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_cycle_to_wraps_around() {
        assert_eq!(cycle_to(&[3, 1, 2], 7), vec![3, 1, 2, 3, 1, 2, 3]);
        assert_eq!(cycle_to(&[3, 1, 2], 2), vec![3, 1]);
        assert!(cycle_to(&[], 5).is_empty());
    }

    #[test]
    fn test_shards_cover_dataset_without_overlap() {
        let replicas = 4;
        let mut seen = HashSet::new();
        for rank in 0..replicas {
            let sampler = DistributedSampler::new(100, replicas, rank).with_seed(7);
            let indices = sampler.indices();
            assert_eq!(indices.len(), 25);
            for i in indices {
                assert!(seen.insert(i), "index {} assigned twice", i);
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_padding_to_multiple_of_replicas() {
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| DistributedSampler::new(10, 3, rank).with_shuffle(false).indices())
            .collect();
        assert_eq!(shards[0], vec![0, 3, 6, 9]);
        assert_eq!(shards[1], vec![1, 4, 7, 0]);
        assert_eq!(shards[2], vec![2, 5, 8, 1]);
    }

    #[test]
    fn test_epoch_reshuffles_deterministically() {
        let mut a = DistributedSampler::new(50, 2, 1).with_seed(1);
        let mut b = DistributedSampler::new(50, 2, 1).with_seed(1);
        assert_eq!(a.indices(), b.indices());

        let first = a.indices();
        a.set_epoch(1);
        b.set_epoch(1);
        assert_ne!(a.indices(), first);
        assert_eq!(a.indices(), b.indices());
    }

    #[test]
    fn test_single_replica_is_a_permutation() {
        let mut indices = DistributedSampler::new(20, 1, 0).with_seed(3).indices();
        indices.sort_unstable();
        assert_eq!(indices, (0..20).collect::<Vec<_>>());
    }
}
