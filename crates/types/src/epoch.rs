//! Epoch identifiers.
//!
//! An epoch is a period during which the validator set and its weights are
//! fixed. Epochs advance by exactly one when a committed vertex carries an
//! epoch-change marker in its ledger header.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Epoch identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct EpochId(pub u64);

impl EpochId {
    /// Genesis epoch.
    pub const GENESIS: Self = EpochId(0);

    /// Get the next epoch.
    pub fn next(self) -> Self {
        EpochId(self.0 + 1)
    }

    /// Get the previous epoch (returns None if at genesis).
    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(EpochId(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}
