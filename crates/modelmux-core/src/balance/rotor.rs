use std::collections::BTreeMap;

use super::{reduce_weight, Balancer, NoCandidates};

/// Smooth weighted round-robin. Each pick raises every candidate's current
/// value by its weight, selects the highest, and charges the winner the
/// weight total. Over `n * sum(weights)` picks every id is returned exactly
/// `n * weight` times, and no positive-weight id waits longer than one full
/// cycle.
pub struct Rotor {
    weights: BTreeMap<i64, u32>,
    current: BTreeMap<i64, i64>,
}

impl Rotor {
    pub fn new(weights: BTreeMap<i64, u32>) -> Self {
        Self {
            weights,
            current: BTreeMap::new(),
        }
    }
}

impl Balancer for Rotor {
    fn pick(&mut self) -> Result<i64, NoCandidates> {
        let total: i64 = self.weights.values().map(|weight| *weight as i64).sum();
        if total == 0 {
            return Err(NoCandidates);
        }

        let mut best: Option<(i64, i64)> = None;
        for (id, weight) in &self.weights {
            if *weight == 0 {
                continue;
            }
            let value = self.current.entry(*id).or_insert(0);
            *value += *weight as i64;
            // Strict comparison keeps ties on the lowest id, which keeps
            // the rotation deterministic.
            if best.map(|(_, best_value)| *value > best_value).unwrap_or(true) {
                best = Some((*id, *value));
            }
        }

        let (id, _) = best.ok_or(NoCandidates)?;
        if let Some(value) = self.current.get_mut(&id) {
            *value -= total;
        }
        Ok(id)
    }

    fn reduce(&mut self, id: i64) {
        if let Some(weight) = self.weights.get_mut(&id) {
            *weight = reduce_weight(*weight);
        }
    }

    fn delete(&mut self, id: i64) {
        self.weights.remove(&id);
        self.current.remove(&id);
    }

    fn success(&mut self, _id: i64) {}
}
