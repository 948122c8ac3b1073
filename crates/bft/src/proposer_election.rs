//! Weighted leader selection.
//!
//! The schedule is built once per epoch with smooth weighted round robin and
//! is a pure function of the validator set, so every replica derives the
//! same leader for every view without talking to anyone. Over one period of
//! `Σ weight / gcd(weights)` views each validator leads exactly its share.

use concord_types::{ValidatorId, ValidatorSet, View};
use std::sync::Arc;

/// Longest schedule built. Larger periods are scaled down proportionally.
const MAX_SCHEDULE_LEN: u64 = 16_384;

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Deterministic `view → leader` mapping for one validator set.
#[derive(Debug, Clone)]
pub struct ProposerElection {
    schedule: Arc<[ValidatorId]>,
}

impl ProposerElection {
    pub fn new(validators: &ValidatorSet) -> Self {
        let mut weights: Vec<(ValidatorId, u64)> = validators
            .iter()
            .map(|v| (v.validator_id, v.voting_power))
            .collect();
        reduce(&mut weights);

        let period: u64 = weights.iter().map(|(_, w)| w).sum();
        if period > MAX_SCHEDULE_LEN {
            for (_, w) in weights.iter_mut() {
                let scaled = (*w as u128 * MAX_SCHEDULE_LEN as u128 / period as u128) as u64;
                *w = scaled.max(1);
            }
            reduce(&mut weights);
        }

        Self {
            schedule: smooth_round_robin(&weights).into(),
        }
    }

    /// Leader of `view`.
    pub fn proposer(&self, view: View) -> ValidatorId {
        let index = (view.0 % self.schedule.len() as u64) as usize;
        self.schedule[index]
    }

    /// Number of views after which the schedule repeats.
    pub fn period(&self) -> usize {
        self.schedule.len()
    }
}

/// Divide all weights by their gcd.
fn reduce(weights: &mut [(ValidatorId, u64)]) {
    let g = weights.iter().fold(0, |acc, (_, w)| gcd(acc, *w));
    if g > 1 {
        for (_, w) in weights.iter_mut() {
            *w /= g;
        }
    }
}

/// One period of smooth weighted round robin. Ties go to the lowest id.
fn smooth_round_robin(weights: &[(ValidatorId, u64)]) -> Vec<ValidatorId> {
    let total: i128 = weights.iter().map(|(_, w)| *w as i128).sum();
    let mut current = vec![0i128; weights.len()];
    let mut schedule = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut best = 0;
        for (i, (_, w)) in weights.iter().enumerate() {
            current[i] += *w as i128;
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        schedule.push(weights[best].0);
    }
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::test_utils::validator_set;
    use std::collections::BTreeMap;

    fn counts(election: &ProposerElection, views: std::ops::RangeInclusive<u64>) -> BTreeMap<ValidatorId, u64> {
        let mut counts = BTreeMap::new();
        for v in views {
            *counts.entry(election.proposer(View(v))).or_default() += 1;
        }
        counts
    }

    #[test]
    fn test_equal_weights_round_robin() {
        let (set, _) = validator_set(&[5, 5, 5, 5]);
        let election = ProposerElection::new(&set);
        assert_eq!(election.period(), 4);
        let order: Vec<u64> = (0..8).map(|v| election.proposer(View(v)).0).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_weighted_proportions() {
        let (set, _) = validator_set(&[1, 2, 3]);
        let election = ProposerElection::new(&set);
        assert_eq!(election.period(), 6);
        let c = counts(&election, 1..=600);
        assert_eq!(c[&ValidatorId(0)], 100);
        assert_eq!(c[&ValidatorId(1)], 200);
        assert_eq!(c[&ValidatorId(2)], 300);
    }

    #[test]
    fn test_smooth_interleaving() {
        // The heavy validator never leads three views in a row.
        let (set, _) = validator_set(&[1, 1, 2]);
        let election = ProposerElection::new(&set);
        let order: Vec<u64> = (0..4).map(|v| election.proposer(View(v)).0).collect();
        assert_eq!(order, vec![2, 0, 1, 2]);
    }

    #[test]
    fn test_fifty_light_fifty_heavy() {
        let weights: Vec<u64> = (0..100).map(|i| if i < 50 { 1 } else { 2 }).collect();
        let (set, _) = validator_set(&weights);
        let election = ProposerElection::new(&set);
        assert_eq!(election.period(), 150);

        let c = counts(&election, 1..=150_000);
        for (id, count) in c {
            let expected = if id.0 < 50 { 1_000 } else { 2_000 };
            assert!(
                count.abs_diff(expected) <= 1,
                "validator {id} proposed {count} times, expected {expected}"
            );
        }
    }

    #[test]
    fn test_huge_weights_scaled() {
        let (set, _) = validator_set(&[1_000_000, 3_000_000, 1]);
        let election = ProposerElection::new(&set);
        assert!(election.period() as u64 <= MAX_SCHEDULE_LEN);
        let c = counts(&election, 0..=(election.period() as u64 - 1));
        assert!(c[&ValidatorId(1)] > 2 * c[&ValidatorId(0)]);
        // Tiny weights still lead at least once per period.
        assert!(c[&ValidatorId(2)] >= 1);
    }

    #[test]
    fn test_deterministic_across_instances() {
        let (set, _) = validator_set(&[3, 1, 4, 1, 5]);
        let a = ProposerElection::new(&set);
        let b = ProposerElection::new(&set);
        for v in 0..100 {
            assert_eq!(a.proposer(View(v)), b.proposer(View(v)));
        }
    }
}
