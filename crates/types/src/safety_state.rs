//! Durable safety state of a replica.

use crate::{EpochId, QuorumCertificate, View, Vote};
use serde::{Deserialize, Serialize};

/// The state that must be persisted before any vote leaves the replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    pub epoch: EpochId,
    pub last_voted_view: View,
    /// Last vote cast, so a timeout for the same view re-signs it instead of
    /// voting twice.
    pub last_vote: Option<Vote>,
    pub highest_qc: QuorumCertificate,
    pub locked_qc: QuorumCertificate,
}

impl SafetyState {
    /// Fresh state at the start of an epoch.
    pub fn new(epoch: EpochId, genesis_qc: QuorumCertificate) -> Self {
        Self {
            epoch,
            last_voted_view: View::GENESIS,
            last_vote: None,
            highest_qc: genesis_qc.clone(),
            locked_qc: genesis_qc,
        }
    }

    /// Carry this state into `epoch`.
    ///
    /// State already at or past `epoch` is kept as is. Views restart in
    /// every epoch, so older state is reset onto the new genesis QC.
    pub fn rebase(&self, epoch: EpochId, genesis_qc: QuorumCertificate) -> Self {
        if self.epoch >= epoch {
            return self.clone();
        }
        Self::new(epoch, genesis_qc)
    }

    pub fn locked_view(&self) -> View {
        self.locked_qc.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::genesis_qc;

    #[test]
    fn test_rebase_resets_older_epoch() {
        let mut state = SafetyState::new(EpochId(0), genesis_qc(EpochId(0)));
        state.last_voted_view = View(9);

        let next = state.rebase(EpochId(1), genesis_qc(EpochId(1)));
        assert_eq!(next.epoch, EpochId(1));
        assert_eq!(next.last_voted_view, View::GENESIS);
        assert_eq!(next.locked_qc.epoch(), EpochId(1));
    }

    #[test]
    fn test_rebase_keeps_current_epoch() {
        let mut state = SafetyState::new(EpochId(2), genesis_qc(EpochId(2)));
        state.last_voted_view = View(5);
        let same = state.rebase(EpochId(2), genesis_qc(EpochId(2)));
        assert_eq!(same, state);
    }

    #[test]
    fn test_json_roundtrip() {
        let state = SafetyState::new(EpochId(0), genesis_qc(EpochId(0)));
        let json = serde_json::to_string(&state).unwrap();
        let back: SafetyState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
