use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{reduce_weight, Balancer, NoCandidates};

/// Weighted random selection. Ids are iterated in ascending order so a
/// seeded instance draws a reproducible sequence.
pub struct Lottery {
    weights: BTreeMap<i64, u32>,
    rng: StdRng,
}

impl Lottery {
    pub fn new(weights: BTreeMap<i64, u32>) -> Self {
        Self {
            weights,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(weights: BTreeMap<i64, u32>, seed: u64) -> Self {
        Self {
            weights,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Balancer for Lottery {
    fn pick(&mut self) -> Result<i64, NoCandidates> {
        let total: u64 = self.weights.values().map(|weight| *weight as u64).sum();
        if total == 0 {
            return Err(NoCandidates);
        }

        let mut roll = self.rng.random_range(0..total);
        for (id, weight) in &self.weights {
            let weight = *weight as u64;
            if roll < weight {
                return Ok(*id);
            }
            roll -= weight;
        }
        Err(NoCandidates)
    }

    fn reduce(&mut self, id: i64) {
        if let Some(weight) = self.weights.get_mut(&id) {
            *weight = reduce_weight(*weight);
        }
    }

    fn delete(&mut self, id: i64) {
        self.weights.remove(&id);
    }

    fn success(&mut self, _id: i64) {}
}
