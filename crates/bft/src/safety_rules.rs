//! The gate every outgoing vote passes through.
//!
//! A vote is only released after the updated [`SafetyState`] has been
//! written to the store. A store failure is reported as
//! [`SafetyError::Persistence`] and the caller must halt.

use concord_core::{PersistenceError, SafetyStateStore};
use concord_types::{
    proposal_message, timeout_message, vote_message, BftHeader, CertificateError, EpochId, Hash,
    HighQc, KeyPair, Proposal, QuorumCertificate, SafetyState, TimeoutCertificate, ValidatorId,
    ValidatorSet, Vertex, View, Vote, VoteData,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error};

/// Certificates remembered as already verified.
const VERIFIED_CACHE_SIZE: usize = 256;

/// Reasons SafetyRules refuses to sign.
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("already voted in view {last_voted}, asked to vote in {view}")]
    AlreadyVoted { view: View, last_voted: View },
    #[error("parent view {parent_view} is not older than view {view}")]
    ParentNotOlder { view: View, parent_view: View },
    #[error("parent view {parent_view} is below locked view {locked_view}")]
    LockViolation { parent_view: View, locked_view: View },
    #[error("vertex for {actual}, safety state is at {expected}")]
    WrongEpoch { expected: EpochId, actual: EpochId },
    #[error("no vote cast in view {0}")]
    NoVoteForView(View),
    #[error("failed to persist safety state: {0}")]
    Persistence(#[from] PersistenceError),
}

impl SafetyError {
    /// Whether the error means safety state may not be durable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SafetyError::Persistence(_))
    }
}

/// Signs votes, timeouts and proposals for one replica and one epoch.
pub struct SafetyRules {
    self_id: ValidatorId,
    key: KeyPair,
    state: SafetyState,
    store: Arc<dyn SafetyStateStore>,
    genesis_qc: QuorumCertificate,
    verified: HashSet<Hash>,
    verified_order: VecDeque<Hash>,
}

impl std::fmt::Debug for SafetyRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyRules")
            .field("self_id", &self.self_id)
            .field("epoch", &self.state.epoch)
            .field("last_voted_view", &self.state.last_voted_view)
            .field("locked_view", &self.state.locked_view())
            .finish()
    }
}

impl SafetyRules {
    pub fn new(
        self_id: ValidatorId,
        key: KeyPair,
        state: SafetyState,
        store: Arc<dyn SafetyStateStore>,
        genesis_qc: QuorumCertificate,
    ) -> Self {
        Self {
            self_id,
            key,
            state,
            store,
            genesis_qc,
            verified: HashSet::new(),
            verified_order: VecDeque::new(),
        }
    }

    pub fn self_id(&self) -> ValidatorId {
        self.self_id
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    pub fn locked_view(&self) -> View {
        self.state.locked_view()
    }

    /// Vote for a vertex the store has prepared as `header`.
    pub fn vote_for(
        &mut self,
        vertex: &Vertex,
        header: BftHeader,
        timestamp_ms: u64,
        high_qc: HighQc,
    ) -> Result<Vote, SafetyError> {
        if vertex.epoch != self.state.epoch {
            return Err(SafetyError::WrongEpoch {
                expected: self.state.epoch,
                actual: vertex.epoch,
            });
        }
        if vertex.view <= self.state.last_voted_view {
            return Err(SafetyError::AlreadyVoted {
                view: vertex.view,
                last_voted: self.state.last_voted_view,
            });
        }
        let parent_view = vertex.parent_qc.view();
        if parent_view >= vertex.view {
            return Err(SafetyError::ParentNotOlder {
                view: vertex.view,
                parent_view,
            });
        }
        let locked_view = self.state.locked_view();
        if parent_view < locked_view {
            return Err(SafetyError::LockViolation {
                parent_view,
                locked_view,
            });
        }

        let vote_data = VoteData::new(header, vertex.parent_qc.proposed().clone());
        let signature = self.key.sign(&vote_message(&vote_data.hash(), timestamp_ms));
        let vote = Vote {
            author: self.self_id,
            vote_data,
            timestamp_ms,
            signature,
            high_qc,
            timeout_signature: None,
        };

        let mut next = self.state.clone();
        next.last_voted_view = vertex.view;
        next.last_vote = Some(vote.clone());
        if parent_view > next.locked_qc.view() {
            next.locked_qc = vertex.parent_qc.clone();
        }
        if parent_view > next.highest_qc.view() {
            next.highest_qc = vertex.parent_qc.clone();
        }
        self.persist(next)?;

        debug!(
            validator = %self.self_id,
            view = vertex.view.0,
            locked_view = self.state.locked_view().0,
            "Signed vote"
        );
        Ok(vote)
    }

    /// Timeout vote for `view`, re-signing the vote already cast in it.
    pub fn timeout_for(&mut self, view: View) -> Result<Vote, SafetyError> {
        let vote = self.last_vote(view).ok_or(SafetyError::NoVoteForView(view))?;
        self.timeout_vote(vote)
    }

    /// Turn a vote into a timeout vote.
    pub fn timeout_vote(&mut self, vote: Vote) -> Result<Vote, SafetyError> {
        if vote.is_timeout() {
            return Ok(vote);
        }
        let view = vote.view();
        let mut timeout = vote;
        timeout.timeout_signature = Some(self.key.sign(&timeout_message(timeout.epoch(), view)));

        let mut next = self.state.clone();
        if next.last_voted_view < view {
            next.last_voted_view = view;
        }
        next.last_vote = Some(timeout.clone());
        self.persist(next)?;
        Ok(timeout)
    }

    /// The vote cast in `view`, if any.
    pub fn last_vote(&self, view: View) -> Option<Vote> {
        self.state
            .last_vote
            .as_ref()
            .filter(|v| v.view() == view)
            .cloned()
    }

    /// Sign a proposal for a vertex this replica built.
    pub fn sign_proposal(&self, vertex: Vertex, high_qc: HighQc) -> Proposal {
        let signature = self.key.sign(&proposal_message(&vertex.hash()));
        Proposal {
            vertex,
            high_qc,
            signature,
        }
    }

    fn persist(&mut self, next: SafetyState) -> Result<(), SafetyError> {
        if let Err(e) = self.store.store(&next) {
            error!(
                validator = %self.self_id,
                error = %e,
                "Failed to persist safety state"
            );
            return Err(e.into());
        }
        self.state = next;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Certificate verification
    // ═══════════════════════════════════════════════════════════════════════════

    fn check_epoch(&self, epoch: EpochId) -> Result<(), CertificateError> {
        if epoch != self.state.epoch {
            return Err(CertificateError::WrongEpoch {
                expected: self.state.epoch,
                actual: epoch,
            });
        }
        Ok(())
    }

    fn remember(&mut self, hash: Hash) {
        if self.verified.insert(hash) {
            self.verified_order.push_back(hash);
            if self.verified_order.len() > VERIFIED_CACHE_SIZE {
                if let Some(old) = self.verified_order.pop_front() {
                    self.verified.remove(&old);
                }
            }
        }
    }

    /// Verify a QC, accepting this epoch's genesis QC unsigned.
    pub fn verify_qc(
        &mut self,
        qc: &QuorumCertificate,
        validators: &ValidatorSet,
    ) -> Result<(), CertificateError> {
        self.check_epoch(qc.epoch())?;
        if *qc == self.genesis_qc {
            return Ok(());
        }
        let hash = qc.hash();
        if self.verified.contains(&hash) {
            return Ok(());
        }
        qc.verify(validators)?;
        self.remember(hash);
        Ok(())
    }

    pub fn verify_tc(
        &mut self,
        tc: &TimeoutCertificate,
        validators: &ValidatorSet,
    ) -> Result<(), CertificateError> {
        self.check_epoch(tc.epoch)?;
        let hash = tc.hash();
        if self.verified.contains(&hash) {
            return Ok(());
        }
        tc.verify(validators)?;
        self.remember(hash);
        Ok(())
    }

    /// Verify every certificate in a [`HighQc`].
    pub fn verify_high_qc(
        &mut self,
        high_qc: &HighQc,
        validators: &ValidatorSet,
    ) -> Result<(), CertificateError> {
        self.verify_qc(&high_qc.highest_qc, validators)?;
        self.verify_qc(&high_qc.highest_committed_qc, validators)?;
        if let Some(tc) = &high_qc.highest_tc {
            self.verify_tc(tc, validators)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{genesis, genesis_store, ledger, qc_on, MemSafetyStore};
    use concord_types::test_utils::{keypair, validator_set};
    use std::sync::atomic::Ordering;

    fn rules(store: Arc<MemSafetyStore>) -> SafetyRules {
        let (_, genesis_qc) = genesis();
        SafetyRules::new(
            ValidatorId(0),
            keypair(0),
            SafetyState::new(EpochId(0), genesis_qc.clone()),
            store,
            genesis_qc,
        )
    }

    fn high() -> HighQc {
        HighQc::from_genesis(genesis().1)
    }

    fn proposal(qc: &QuorumCertificate, view: u64) -> Vertex {
        Vertex::new_proposal(qc.clone(), View(view), ValidatorId(1), vec![])
    }

    #[test]
    fn test_votes_once_per_view() {
        let store = Arc::new(MemSafetyStore::default());
        let mut safety = rules(store.clone());
        let (mut vs, genesis_qc) = genesis_store(ledger());

        let v1 = proposal(&genesis_qc, 1);
        let h1 = vs.insert(v1.clone()).unwrap();
        let vote = safety.vote_for(&v1, h1.clone(), 10, high()).unwrap();
        assert_eq!(vote.view(), View(1));
        assert!(vote.verify(&keypair(0).public_key()));
        assert_eq!(store.saved.lock().len(), 1);

        let again = safety.vote_for(&v1, h1, 11, high());
        assert!(matches!(again, Err(SafetyError::AlreadyVoted { .. })));
    }

    #[test]
    fn test_lock_rule() {
        let store = Arc::new(MemSafetyStore::default());
        let mut safety = rules(store);
        let (mut vs, genesis_qc) = genesis_store(ledger());

        let h1 = vs.insert(proposal(&genesis_qc, 1)).unwrap();
        let qc1 = qc_on(&vs, &h1);
        let v2 = proposal(&qc1, 2);
        let h2 = vs.insert(v2.clone()).unwrap();
        safety.vote_for(&v2, h2, 0, high()).unwrap();
        assert_eq!(safety.locked_view(), View(1));

        // A conflicting vertex extending genesis violates the lock.
        let fork = proposal(&genesis_qc, 3);
        let hf = vs.insert(fork.clone()).unwrap();
        assert!(matches!(
            safety.vote_for(&fork, hf, 0, high()),
            Err(SafetyError::LockViolation {
                parent_view: View(0),
                locked_view: View(1)
            })
        ));
    }

    #[test]
    fn test_parent_must_be_older() {
        let store = Arc::new(MemSafetyStore::default());
        let mut safety = rules(store);
        let (mut vs, genesis_qc) = genesis_store(ledger());
        let h1 = vs.insert(proposal(&genesis_qc, 1)).unwrap();
        let qc1 = qc_on(&vs, &h1);
        // Never inserted: the store would reject it, SafetyRules must too.
        let bad = proposal(&qc1, 1);
        let header = BftHeader::new(View(1), bad.hash(), h1.ledger.clone());
        assert!(matches!(
            safety.vote_for(&bad, header, 0, high()),
            Err(SafetyError::ParentNotOlder {
                view: View(1),
                parent_view: View(1)
            })
        ));
    }

    #[test]
    fn test_timeout_reuses_last_vote() {
        let store = Arc::new(MemSafetyStore::default());
        let mut safety = rules(store);
        let (mut vs, genesis_qc) = genesis_store(ledger());
        let v1 = proposal(&genesis_qc, 1);
        let h1 = vs.insert(v1.clone()).unwrap();
        let vote = safety.vote_for(&v1, h1, 5, high()).unwrap();

        let timeout = safety.timeout_for(View(1)).unwrap();
        assert!(timeout.is_timeout());
        assert_eq!(timeout.vote_data, vote.vote_data);
        assert!(timeout.verify(&keypair(0).public_key()));
        assert!(matches!(
            safety.timeout_for(View(2)),
            Err(SafetyError::NoVoteForView(View(2)))
        ));
    }

    #[test]
    fn test_persistence_failure_is_fatal_and_withholds_vote() {
        let store = Arc::new(MemSafetyStore::default());
        let mut safety = rules(store.clone());
        let (mut vs, genesis_qc) = genesis_store(ledger());
        let v1 = proposal(&genesis_qc, 1);
        let h1 = vs.insert(v1.clone()).unwrap();

        store.fail.store(true, Ordering::SeqCst);
        let err = safety.vote_for(&v1, h1, 0, high()).unwrap_err();
        assert!(err.is_fatal());
        // In-memory state did not move either.
        assert_eq!(safety.state().last_voted_view, View(0));
    }

    #[test]
    fn test_verify_qc_cache_and_genesis() {
        let store = Arc::new(MemSafetyStore::default());
        let mut safety = rules(store);
        let (set, _) = validator_set(&[1, 1, 1, 1]);
        let (mut vs, genesis_qc) = genesis_store(ledger());

        assert_eq!(safety.verify_qc(&genesis_qc, &set), Ok(()));
        let h1 = vs.insert(proposal(&genesis_qc, 1)).unwrap();
        let qc1 = qc_on(&vs, &h1);
        assert_eq!(safety.verify_qc(&qc1, &set), Ok(()));
        assert_eq!(safety.verify_qc(&qc1, &set), Ok(()));

        let mut forged = qc1.clone();
        forged.signatures = Default::default();
        assert_eq!(
            safety.verify_qc(&forged, &set),
            Err(CertificateError::Unsigned)
        );
    }

    #[test]
    fn test_sign_proposal_verifies() {
        let store = Arc::new(MemSafetyStore::default());
        let safety = rules(store);
        let (_, genesis_qc) = genesis();
        let vertex = Vertex::new_proposal(genesis_qc, View(1), ValidatorId(0), vec![]);
        let proposal = safety.sign_proposal(vertex, high());
        assert!(proposal.verify(&keypair(0).public_key()));
    }
}
