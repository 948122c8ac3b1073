//! Quorum and timeout certificates.

use crate::signing::{timeout_message, vote_message, DOMAIN_VOTE};
use crate::{BftHeader, EpochId, Hash, LedgerHeader, Signature, ValidatorId, ValidatorSet, View};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Errors from certificate verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate carries no signatures")]
    Unsigned,
    #[error("signer {0} is not in the validator set")]
    UnknownSigner(ValidatorId),
    #[error("invalid signature from {0}")]
    InvalidSignature(ValidatorId),
    #[error("insufficient voting power: have {have}, need {need}")]
    InsufficientVotingPower { have: u64, need: u64 },
    #[error("certificate is for {actual}, expected {expected}")]
    WrongEpoch { expected: EpochId, actual: EpochId },
}

/// What a vote endorses: a vertex, its parent, and the vertex the vote
/// would commit under the 2-chain rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteData {
    pub proposed: BftHeader,
    pub parent: BftHeader,
    pub committed: Option<BftHeader>,
}

impl VoteData {
    /// Build vote data, committing `parent` when it sits exactly one view
    /// below `proposed`.
    pub fn new(proposed: BftHeader, parent: BftHeader) -> Self {
        let committed = (proposed.view == parent.view.next()).then(|| parent.clone());
        Self {
            proposed,
            parent,
            committed,
        }
    }

    pub fn view(&self) -> View {
        self.proposed.view
    }

    pub fn epoch(&self) -> EpochId {
        self.proposed.ledger.epoch
    }

    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(DOMAIN_VOTE);
        self.encode_into(&mut buf);
        Hash::from_bytes(&buf)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.proposed.encode_into(out);
        self.parent.encode_into(out);
        match &self.committed {
            Some(header) => {
                out.push(1);
                header.encode_into(out);
            }
            None => out.push(0),
        }
    }
}

/// A signature together with the signer's local timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedSignature {
    pub timestamp_ms: u64,
    pub signature: Signature,
}

/// Per-signer signatures collected into a certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedSignatures(BTreeMap<ValidatorId, TimestampedSignature>);

impl TimestampedSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine individual signatures. A later entry for the same signer
    /// replaces an earlier one.
    pub fn aggregate(
        signatures: impl IntoIterator<Item = (ValidatorId, TimestampedSignature)>,
    ) -> Self {
        Self(signatures.into_iter().collect())
    }

    pub fn insert(&mut self, signer: ValidatorId, signature: TimestampedSignature) {
        self.0.insert(signer, signature);
    }

    pub fn get(&self, signer: ValidatorId) -> Option<&TimestampedSignature> {
        self.0.get(&signer)
    }

    pub fn get_mut(&mut self, signer: ValidatorId) -> Option<&mut TimestampedSignature> {
        self.0.get_mut(&signer)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn signers(&self) -> impl Iterator<Item = &ValidatorId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ValidatorId, &TimestampedSignature)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ValidatorId, &mut TimestampedSignature)> {
        self.0.iter_mut()
    }

    /// Weighted median of the signer timestamps.
    pub fn weighted_timestamp(&self, validators: &ValidatorSet) -> Option<u64> {
        let mut entries: Vec<(u64, u64)> = self
            .0
            .iter()
            .filter_map(|(id, s)| validators.voting_power(*id).map(|w| (s.timestamp_ms, w)))
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_unstable();
        let total: u64 = entries.iter().map(|(_, w)| w).sum();
        let mut acc = 0;
        for (ts, w) in &entries {
            acc += w;
            if acc * 2 >= total {
                return Some(*ts);
            }
        }
        entries.last().map(|(ts, _)| *ts)
    }
}

/// Proof that a quorum of voting power voted for `vote_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub vote_data: VoteData,
    pub signatures: TimestampedSignatures,
}

impl QuorumCertificate {
    /// Certificate with no signatures. Only valid as an epoch anchor.
    pub fn unsigned(proposed: BftHeader, parent: BftHeader, committed: Option<BftHeader>) -> Self {
        Self {
            vote_data: VoteData {
                proposed,
                parent,
                committed,
            },
            signatures: TimestampedSignatures::new(),
        }
    }

    /// The root certificate of an epoch: it certifies and commits the
    /// genesis vertex.
    pub fn genesis(genesis: BftHeader) -> Self {
        Self::unsigned(genesis.clone(), genesis.clone(), Some(genesis))
    }

    pub fn view(&self) -> View {
        self.vote_data.proposed.view
    }

    pub fn epoch(&self) -> EpochId {
        self.vote_data.epoch()
    }

    pub fn vertex_hash(&self) -> Hash {
        self.vote_data.proposed.vertex_hash
    }

    pub fn proposed(&self) -> &BftHeader {
        &self.vote_data.proposed
    }

    pub fn parent(&self) -> &BftHeader {
        &self.vote_data.parent
    }

    pub fn committed(&self) -> Option<&BftHeader> {
        self.vote_data.committed.as_ref()
    }

    pub fn ledger_header(&self) -> &LedgerHeader {
        &self.vote_data.proposed.ledger
    }

    pub fn is_unsigned(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Identity of the certificate including its signatures.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(512);
        self.vote_data.encode_into(&mut buf);
        for (id, s) in self.signatures.iter() {
            buf.extend_from_slice(&id.0.to_le_bytes());
            buf.extend_from_slice(&s.timestamp_ms.to_le_bytes());
            buf.extend_from_slice(s.signature.as_bytes());
        }
        Hash::from_bytes(&buf)
    }

    /// Verify every signature and the total signing weight.
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), CertificateError> {
        if self.signatures.is_empty() {
            return Err(CertificateError::Unsigned);
        }
        let data_hash = self.vote_data.hash();
        let mut weight = 0u64;
        for (id, s) in self.signatures.iter() {
            let info = validators
                .get(*id)
                .ok_or(CertificateError::UnknownSigner(*id))?;
            let msg = vote_message(&data_hash, s.timestamp_ms);
            if !info.public_key.verify(&msg, &s.signature) {
                return Err(CertificateError::InvalidSignature(*id));
            }
            weight += info.voting_power;
        }
        let need = validators.quorum_threshold();
        if weight < need {
            return Err(CertificateError::InsufficientVotingPower { have: weight, need });
        }
        Ok(())
    }
}

/// Proof that a quorum of voting power abandoned `view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    pub epoch: EpochId,
    pub view: View,
    pub signatures: BTreeMap<ValidatorId, Signature>,
}

impl TimeoutCertificate {
    pub fn signers(&self) -> impl Iterator<Item = &ValidatorId> {
        self.signatures.keys()
    }

    pub fn hash(&self) -> Hash {
        let mut buf = timeout_message(self.epoch, self.view);
        for (id, sig) in &self.signatures {
            buf.extend_from_slice(&id.0.to_le_bytes());
            buf.extend_from_slice(sig.as_bytes());
        }
        Hash::from_bytes(&buf)
    }

    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), CertificateError> {
        if self.signatures.is_empty() {
            return Err(CertificateError::Unsigned);
        }
        let msg = timeout_message(self.epoch, self.view);
        let mut weight = 0u64;
        for (id, sig) in &self.signatures {
            let info = validators
                .get(*id)
                .ok_or(CertificateError::UnknownSigner(*id))?;
            if !info.public_key.verify(&msg, sig) {
                return Err(CertificateError::InvalidSignature(*id));
            }
            weight += info.voting_power;
        }
        let need = validators.quorum_threshold();
        if weight < need {
            return Err(CertificateError::InsufficientVotingPower { have: weight, need });
        }
        Ok(())
    }
}

/// The certificates a replica advertises to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighQc {
    pub highest_qc: QuorumCertificate,
    pub highest_committed_qc: QuorumCertificate,
    pub highest_tc: Option<TimeoutCertificate>,
}

impl HighQc {
    /// High QC right after genesis: everything points at the genesis QC.
    pub fn from_genesis(genesis_qc: QuorumCertificate) -> Self {
        Self {
            highest_qc: genesis_qc.clone(),
            highest_committed_qc: genesis_qc,
            highest_tc: None,
        }
    }

    pub fn epoch(&self) -> EpochId {
        self.highest_qc.epoch()
    }

    /// Highest view certified by either the QC or the TC.
    pub fn highest_view(&self) -> View {
        let qc_view = self.highest_qc.view();
        match &self.highest_tc {
            Some(tc) if tc.view > qc_view => tc.view,
            _ => qc_view,
        }
    }
}
