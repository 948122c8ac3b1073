//! Aggregation of votes into quorum and timeout certificates.
//!
//! Regular votes are grouped by `(view, vote data hash)`; timeout votes by
//! view alone and they count only toward a TC. Each group emits its
//! certificate exactly once, on the vote that first crosses the threshold.

use concord_types::{
    EpochId, Hash, QuorumCertificate, Signature, TimeoutCertificate, TimestampedSignature,
    TimestampedSignatures, ValidatorId, ValidatorSet, View, Vote, VoteData,
};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Result of adding a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    NoQuorumYet,
    FormedQc(QuorumCertificate),
    FormedTc(TimeoutCertificate),
}

/// Errors from [`PendingVotes::insert_vote`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PendingVotesError {
    #[error("vote from unknown validator {0}")]
    UnknownValidator(ValidatorId),
    #[error("{author} already voted in view {view}")]
    DuplicateAuthor { author: ValidatorId, view: View },
}

#[derive(Debug)]
struct VoteGroup {
    vote_data: VoteData,
    signatures: TimestampedSignatures,
    weight: u64,
    formed: bool,
}

#[derive(Debug)]
struct TimeoutGroup {
    epoch: EpochId,
    signatures: BTreeMap<ValidatorId, Signature>,
    weight: u64,
    formed: bool,
}

/// Votes collected for one epoch.
#[derive(Debug, Default)]
pub struct PendingVotes {
    votes: BTreeMap<(View, Hash), VoteGroup>,
    timeouts: BTreeMap<View, TimeoutGroup>,
    /// Latest regular vote per author.
    last_vote: HashMap<ValidatorId, (View, Hash)>,
    /// Latest timeout vote per author.
    last_timeout: HashMap<ValidatorId, View>,
}

impl PendingVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vote whose signatures the caller has already verified.
    pub fn insert_vote(
        &mut self,
        vote: &Vote,
        validators: &ValidatorSet,
    ) -> Result<VoteOutcome, PendingVotesError> {
        let weight = validators
            .voting_power(vote.author)
            .ok_or(PendingVotesError::UnknownValidator(vote.author))?;
        match &vote.timeout_signature {
            Some(sig) => self.insert_timeout(vote, *sig, weight, validators),
            None => self.insert_regular(vote, weight, validators),
        }
    }

    fn insert_regular(
        &mut self,
        vote: &Vote,
        weight: u64,
        validators: &ValidatorSet,
    ) -> Result<VoteOutcome, PendingVotesError> {
        let view = vote.view();
        let data_hash = vote.vote_data.hash();

        if let Some((prev_view, prev_hash)) = self.last_vote.get(&vote.author).copied() {
            if view == prev_view {
                return Err(PendingVotesError::DuplicateAuthor {
                    author: vote.author,
                    view,
                });
            }
            if view < prev_view {
                trace!(author = %vote.author, view = view.0, "Ignoring vote older than author's latest");
                return Ok(VoteOutcome::NoQuorumYet);
            }
            self.remove_regular(vote.author, (prev_view, prev_hash), validators);
        }
        self.last_vote.insert(vote.author, (view, data_hash));

        let group = self
            .votes
            .entry((view, data_hash))
            .or_insert_with(|| VoteGroup {
                vote_data: vote.vote_data.clone(),
                signatures: TimestampedSignatures::new(),
                weight: 0,
                formed: false,
            });
        group.signatures.insert(
            vote.author,
            TimestampedSignature {
                timestamp_ms: vote.timestamp_ms,
                signature: vote.signature,
            },
        );
        group.weight += weight;

        if !group.formed && validators.has_quorum(group.weight) {
            group.formed = true;
            return Ok(VoteOutcome::FormedQc(QuorumCertificate {
                vote_data: group.vote_data.clone(),
                signatures: group.signatures.clone(),
            }));
        }
        Ok(VoteOutcome::NoQuorumYet)
    }

    fn insert_timeout(
        &mut self,
        vote: &Vote,
        signature: Signature,
        weight: u64,
        validators: &ValidatorSet,
    ) -> Result<VoteOutcome, PendingVotesError> {
        let view = vote.view();

        if let Some(prev_view) = self.last_timeout.get(&vote.author).copied() {
            if view == prev_view {
                return Err(PendingVotesError::DuplicateAuthor {
                    author: vote.author,
                    view,
                });
            }
            if view < prev_view {
                return Ok(VoteOutcome::NoQuorumYet);
            }
            self.remove_timeout(vote.author, prev_view, validators);
        }
        self.last_timeout.insert(vote.author, view);

        let group = self.timeouts.entry(view).or_insert_with(|| TimeoutGroup {
            epoch: vote.epoch(),
            signatures: BTreeMap::new(),
            weight: 0,
            formed: false,
        });
        group.signatures.insert(vote.author, signature);
        group.weight += weight;

        if !group.formed && validators.has_quorum(group.weight) {
            group.formed = true;
            return Ok(VoteOutcome::FormedTc(TimeoutCertificate {
                epoch: group.epoch,
                view,
                signatures: group.signatures.clone(),
            }));
        }
        Ok(VoteOutcome::NoQuorumYet)
    }

    fn remove_regular(&mut self, author: ValidatorId, key: (View, Hash), validators: &ValidatorSet) {
        let Some(group) = self.votes.get_mut(&key) else {
            return;
        };
        if group.formed {
            return;
        }
        group.signatures = TimestampedSignatures::aggregate(
            group
                .signatures
                .iter()
                .filter(|(id, _)| **id != author)
                .map(|(id, s)| (*id, *s)),
        );
        group.weight = group
            .weight
            .saturating_sub(validators.voting_power(author).unwrap_or(0));
        if group.signatures.is_empty() {
            self.votes.remove(&key);
        }
    }

    fn remove_timeout(&mut self, author: ValidatorId, view: View, validators: &ValidatorSet) {
        let Some(group) = self.timeouts.get_mut(&view) else {
            return;
        };
        if group.formed {
            return;
        }
        if group.signatures.remove(&author).is_some() {
            group.weight = group
                .weight
                .saturating_sub(validators.voting_power(author).unwrap_or(0));
        }
        if group.signatures.is_empty() {
            self.timeouts.remove(&view);
        }
    }

    /// Drop every group for views below `view`.
    pub fn prune_below(&mut self, view: View) {
        self.votes.retain(|(v, _), _| *v >= view);
        self.timeouts.retain(|v, _| *v >= view);
    }

    /// Number of vote and timeout groups held.
    pub fn len(&self) -> usize {
        self.votes.len() + self.timeouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
