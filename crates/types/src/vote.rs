//! Votes and proposals.

use crate::signing::{proposal_message, timeout_message, vote_message};
use crate::{EpochId, Hash, HighQc, PublicKey, Signature, ValidatorId, Vertex, View, VoteData};
use serde::{Deserialize, Serialize};

/// A validator's endorsement of a vertex.
///
/// A vote carrying `timeout_signature` is a timeout vote: it attests that the
/// author abandoned the vote's view. Timeout votes only count toward a
/// timeout certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub author: ValidatorId,
    pub vote_data: VoteData,
    pub timestamp_ms: u64,
    /// Signature over `vote_message(vote_data.hash(), timestamp_ms)`.
    pub signature: Signature,
    /// The author's certificates when it cast the vote.
    pub high_qc: HighQc,
    /// Signature over `timeout_message(epoch, view)`.
    pub timeout_signature: Option<Signature>,
}

impl Vote {
    pub fn view(&self) -> View {
        self.vote_data.view()
    }

    pub fn epoch(&self) -> EpochId {
        self.vote_data.epoch()
    }

    pub fn vertex_hash(&self) -> Hash {
        self.vote_data.proposed.vertex_hash
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout_signature.is_some()
    }

    /// Check both signatures against the author's key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        let msg = vote_message(&self.vote_data.hash(), self.timestamp_ms);
        if !key.verify(&msg, &self.signature) {
            return false;
        }
        match &self.timeout_signature {
            Some(sig) => key.verify(&timeout_message(self.epoch(), self.view()), sig),
            None => true,
        }
    }
}

/// A leader's proposal for a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub vertex: Vertex,
    /// Justification for the view, including the TC when the leader skipped
    /// views.
    pub high_qc: HighQc,
    /// Proposer's signature over the vertex hash.
    pub signature: Signature,
}

impl Proposal {
    pub fn view(&self) -> View {
        self.vertex.view
    }

    pub fn epoch(&self) -> EpochId {
        self.vertex.epoch
    }

    pub fn author(&self) -> Option<ValidatorId> {
        self.vertex.proposer
    }

    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(&proposal_message(&self.vertex.hash()), &self.signature)
    }
}
