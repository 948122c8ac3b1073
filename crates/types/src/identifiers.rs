//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Validator identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ValidatorId(pub u64);

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// A consensus round. Views restart at [`View::GENESIS`] in every epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct View(pub u64);

impl View {
    /// View of the per-epoch genesis vertex.
    pub const GENESIS: Self = View(0);

    pub fn next(self) -> Self {
        View(self.0 + 1)
    }

    /// The previous view, saturating at genesis.
    pub fn prev(self) -> Self {
        View(self.0.saturating_sub(1))
    }

    pub fn is_genesis(self) -> bool {
        self.0 == 0
    }

    /// Number of views strictly between `self` and `later`.
    pub fn gap_to(self, later: View) -> u64 {
        later.0.saturating_sub(self.0).saturating_sub(1)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
