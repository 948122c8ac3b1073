//! Validator set for one epoch.

use crate::{PublicKey, ValidatorId};
use serde::{Deserialize, Serialize};

/// Errors building a validator set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,
    #[error("validator {0} appears more than once")]
    DuplicateValidator(ValidatorId),
    #[error("validator {0} has zero voting power")]
    ZeroVotingPower(ValidatorId),
    #[error("total voting power overflows u64")]
    VotingPowerOverflow,
}

/// Information about a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Validator identifier.
    pub validator_id: ValidatorId,
    /// Public key used to verify its signatures.
    pub public_key: PublicKey,
    /// Voting weight.
    pub voting_power: u64,
}

/// Immutable-per-epoch mapping of validator identity to key and weight.
///
/// Validators are kept sorted by id so iteration order is the same on every
/// replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ValidatorInfo>", into = "Vec<ValidatorInfo>")]
pub struct ValidatorSet {
    validators: Vec<ValidatorInfo>,
    total_voting_power: u64,
}

impl ValidatorSet {
    /// Create a validator set. Order of `validators` does not matter.
    pub fn new(mut validators: Vec<ValidatorInfo>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        validators.sort_by_key(|v| v.validator_id);

        let mut total: u64 = 0;
        for (i, v) in validators.iter().enumerate() {
            if i > 0 && validators[i - 1].validator_id == v.validator_id {
                return Err(ValidatorSetError::DuplicateValidator(v.validator_id));
            }
            if v.voting_power == 0 {
                return Err(ValidatorSetError::ZeroVotingPower(v.validator_id));
            }
            total = total
                .checked_add(v.voting_power)
                .ok_or(ValidatorSetError::VotingPowerOverflow)?;
        }

        Ok(Self {
            validators,
            total_voting_power: total,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Iterate validators in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ValidatorInfo> {
        self.validators.iter()
    }

    /// Validator ids in id order.
    pub fn ids(&self) -> impl Iterator<Item = ValidatorId> + '_ {
        self.validators.iter().map(|v| v.validator_id)
    }

    pub fn get(&self, id: ValidatorId) -> Option<&ValidatorInfo> {
        self.validators
            .binary_search_by_key(&id, |v| v.validator_id)
            .ok()
            .map(|i| &self.validators[i])
    }

    pub fn contains(&self, id: ValidatorId) -> bool {
        self.get(id).is_some()
    }

    pub fn public_key(&self, id: ValidatorId) -> Option<&PublicKey> {
        self.get(id).map(|v| &v.public_key)
    }

    pub fn voting_power(&self, id: ValidatorId) -> Option<u64> {
        self.get(id).map(|v| v.voting_power)
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    /// Smallest weight strictly greater than two thirds of the total.
    pub fn quorum_threshold(&self) -> u64 {
        // u128 so huge totals cannot overflow the multiplication.
        ((self.total_voting_power as u128 * 2) / 3 + 1) as u64
    }

    /// Check whether `weight` reaches the quorum threshold.
    pub fn has_quorum(&self, weight: u64) -> bool {
        weight >= self.quorum_threshold()
    }

    /// Summed weight of the distinct validators in `signers`; unknown ids
    /// contribute nothing.
    pub fn weight_of<'a>(&self, signers: impl IntoIterator<Item = &'a ValidatorId>) -> u64 {
        let mut seen = std::collections::BTreeSet::new();
        signers
            .into_iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| self.voting_power(*id))
            .sum()
    }

    /// Canonical byte encoding used for content hashing.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.validators.len() as u64).to_le_bytes());
        for v in &self.validators {
            out.extend_from_slice(&v.validator_id.0.to_le_bytes());
            out.extend_from_slice(v.public_key.as_bytes());
            out.extend_from_slice(&v.voting_power.to_le_bytes());
        }
    }
}

impl TryFrom<Vec<ValidatorInfo>> for ValidatorSet {
    type Error = ValidatorSetError;

    fn try_from(validators: Vec<ValidatorInfo>) -> Result<Self, Self::Error> {
        ValidatorSet::new(validators)
    }
}

impl From<ValidatorSet> for Vec<ValidatorInfo> {
    fn from(set: ValidatorSet) -> Self {
        set.validators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn info(id: u64, power: u64) -> ValidatorInfo {
        ValidatorInfo {
            validator_id: ValidatorId(id),
            public_key: KeyPair::from_seed([id as u8; 32]).public_key(),
            voting_power: power,
        }
    }

    #[test]
    fn test_quorum_threshold_equal_weights() {
        let set = ValidatorSet::new((0..4).map(|i| info(i, 1)).collect()).unwrap();
        assert_eq!(set.quorum_threshold(), 3);
        assert!(!set.has_quorum(2));
        assert!(set.has_quorum(3));
    }

    #[test]
    fn test_quorum_threshold_weighted() {
        // total 150 -> need 101
        let set = ValidatorSet::new(
            (0..100)
                .map(|i| info(i, if i < 50 { 1 } else { 2 }))
                .collect(),
        )
        .unwrap();
        assert_eq!(set.total_voting_power(), 150);
        assert_eq!(set.quorum_threshold(), 101);
    }

    #[test]
    fn test_sorted_by_id() {
        let set = ValidatorSet::new(vec![info(3, 1), info(1, 1), info(2, 1)]).unwrap();
        let ids: Vec<_> = set.ids().collect();
        assert_eq!(ids, vec![ValidatorId(1), ValidatorId(2), ValidatorId(3)]);
        assert_eq!(set.voting_power(ValidatorId(2)), Some(1));
        assert_eq!(set.voting_power(ValidatorId(9)), None);
    }

    #[test]
    fn test_rejects_invalid_sets() {
        assert_eq!(ValidatorSet::new(vec![]), Err(ValidatorSetError::Empty));
        assert_eq!(
            ValidatorSet::new(vec![info(1, 1), info(1, 2)]),
            Err(ValidatorSetError::DuplicateValidator(ValidatorId(1)))
        );
        assert_eq!(
            ValidatorSet::new(vec![info(1, 0)]),
            Err(ValidatorSetError::ZeroVotingPower(ValidatorId(1)))
        );
        assert_eq!(
            ValidatorSet::new(vec![info(1, u64::MAX), info(2, 1)]),
            Err(ValidatorSetError::VotingPowerOverflow)
        );
    }

    #[test]
    fn test_weight_of_counts_distinct_known_signers() {
        let set = ValidatorSet::new((0..4).map(|i| info(i, 2)).collect()).unwrap();
        let signers = [ValidatorId(0), ValidatorId(0), ValidatorId(1), ValidatorId(42)];
        assert_eq!(set.weight_of(signers.iter()), 4);
    }
}
