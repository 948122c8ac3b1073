//! Core types for Concord consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, cryptographic keys and signatures
//! - **Identifiers**: ValidatorId, View, EpochId
//! - **Consensus types**: Vertex, BftHeader, QuorumCertificate, Vote, etc.
//! - **Signing**: domain-separated messages for every signature
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend on
//! any other workspace crates, making it the foundation layer.

mod crypto;
mod hash;
mod identifiers;
mod signing;

// Consensus types
mod epoch;
mod quorum_certificate;
mod safety_state;
mod validator;
mod vertex;
mod vote;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use epoch::EpochId;
pub use hash::{Hash, HexError};
pub use identifiers::{ValidatorId, View};
pub use signing::{
    proposal_message, timeout_message, vote_message, DOMAIN_PROPOSAL, DOMAIN_TIMEOUT,
    DOMAIN_VERTEX, DOMAIN_VOTE,
};

pub use quorum_certificate::{
    CertificateError, HighQc, QuorumCertificate, TimeoutCertificate, TimestampedSignature,
    TimestampedSignatures, VoteData,
};
pub use safety_state::SafetyState;
pub use validator::{ValidatorInfo, ValidatorSet, ValidatorSetError};
pub use vertex::{BftHeader, Command, LedgerHeader, PreparedVertex, Vertex};
pub use vote::{Proposal, Vote};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic key pair for a validator index.
    pub fn keypair(index: u64) -> KeyPair {
        let seed = Hash::from_parts(&[b"concord-test-key", &index.to_le_bytes()]);
        KeyPair::from_seed(*seed.as_bytes())
    }

    /// Validator set with ids `0..weights.len()` and the matching key pairs.
    pub fn validator_set(weights: &[u64]) -> (ValidatorSet, Vec<KeyPair>) {
        let keys: Vec<KeyPair> = (0..weights.len() as u64).map(keypair).collect();
        let infos = weights
            .iter()
            .zip(&keys)
            .enumerate()
            .map(|(i, (w, k))| ValidatorInfo {
                validator_id: ValidatorId(i as u64),
                public_key: k.public_key(),
                voting_power: *w,
            })
            .collect();
        let set = ValidatorSet::new(infos).expect("test weights must be non-zero");
        (set, keys)
    }

    /// Ledger header a test epoch starts from.
    pub fn genesis_ledger(epoch: EpochId) -> LedgerHeader {
        LedgerHeader {
            epoch,
            ..LedgerHeader::genesis()
        }
    }

    /// Genesis QC of a test epoch.
    pub fn genesis_qc(epoch: EpochId) -> QuorumCertificate {
        let ledger = genesis_ledger(epoch);
        let vertex = Vertex::genesis(&ledger);
        QuorumCertificate::genesis(BftHeader::new(View::GENESIS, vertex.hash(), ledger))
    }

    /// QC over `data` signed by `keys[i]` as `ValidatorId(i)`.
    pub fn signed_qc(data: &VoteData, keys: &[KeyPair]) -> QuorumCertificate {
        let data_hash = data.hash();
        let signatures = TimestampedSignatures::aggregate(keys.iter().enumerate().map(|(i, k)| {
            let timestamp_ms = 1_000 + i as u64;
            (
                ValidatorId(i as u64),
                TimestampedSignature {
                    timestamp_ms,
                    signature: k.sign(&vote_message(&data_hash, timestamp_ms)),
                },
            )
        }));
        QuorumCertificate {
            vote_data: data.clone(),
            signatures,
        }
    }
}
