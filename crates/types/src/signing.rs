//! Canonical signing messages.
//!
//! Every signed payload starts with a domain tag so a signature produced for
//! one purpose can never be replayed as another.

use crate::{EpochId, Hash, View};

pub const DOMAIN_VOTE: &[u8] = b"concord/vote/v1";
pub const DOMAIN_TIMEOUT: &[u8] = b"concord/timeout/v1";
pub const DOMAIN_PROPOSAL: &[u8] = b"concord/proposal/v1";
pub const DOMAIN_VERTEX: &[u8] = b"concord/vertex/v1";

/// Message signed by a vote: the vote data hash plus the voter's timestamp.
pub fn vote_message(vote_data_hash: &Hash, timestamp_ms: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DOMAIN_VOTE.len() + 40);
    msg.extend_from_slice(DOMAIN_VOTE);
    msg.extend_from_slice(vote_data_hash.as_bytes());
    msg.extend_from_slice(&timestamp_ms.to_le_bytes());
    msg
}

/// Message signed when abandoning `view` in `epoch`.
pub fn timeout_message(epoch: EpochId, view: View) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DOMAIN_TIMEOUT.len() + 16);
    msg.extend_from_slice(DOMAIN_TIMEOUT);
    msg.extend_from_slice(&epoch.0.to_le_bytes());
    msg.extend_from_slice(&view.0.to_le_bytes());
    msg
}

/// Message signed by a proposer over the proposed vertex.
pub fn proposal_message(vertex_hash: &Hash) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DOMAIN_PROPOSAL.len() + 32);
    msg.extend_from_slice(DOMAIN_PROPOSAL);
    msg.extend_from_slice(vertex_hash.as_bytes());
    msg
}
