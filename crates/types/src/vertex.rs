//! Vertices and the headers that describe them.

use crate::signing::DOMAIN_VERTEX;
use crate::{EpochId, Hash, QuorumCertificate, ValidatorId, ValidatorSet, View};
use serde::{Deserialize, Serialize};

/// Opaque command bytes. Consensus never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command(pub Vec<u8>);

impl Command {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Command(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Ledger state after speculatively executing a vertex.
///
/// Produced by the ledger executor. A header with `next_validators` set marks
/// the last vertex of its epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub epoch: EpochId,
    pub state_version: u64,
    pub accumulator: Hash,
    pub next_validators: Option<ValidatorSet>,
}

impl LedgerHeader {
    /// Ledger header at the very beginning of the chain.
    pub fn genesis() -> Self {
        Self {
            epoch: EpochId::GENESIS,
            state_version: 0,
            accumulator: Hash::ZERO,
            next_validators: None,
        }
    }

    pub fn is_end_of_epoch(&self) -> bool {
        self.next_validators.is_some()
    }

    /// Header the next epoch starts from, if this header ends its epoch.
    pub fn next_epoch_genesis(&self) -> Option<LedgerHeader> {
        self.next_validators.as_ref().map(|_| LedgerHeader {
            epoch: self.epoch.next(),
            state_version: self.state_version,
            accumulator: self.accumulator,
            next_validators: None,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.epoch.0.to_le_bytes());
        out.extend_from_slice(&self.state_version.to_le_bytes());
        out.extend_from_slice(self.accumulator.as_bytes());
        match &self.next_validators {
            Some(set) => {
                out.push(1);
                set.encode_into(out);
            }
            None => out.push(0),
        }
    }
}

/// Consensus-level summary of a vertex: its view, hash and ledger result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BftHeader {
    pub view: View,
    pub vertex_hash: Hash,
    pub ledger: LedgerHeader,
}

impl BftHeader {
    pub fn new(view: View, vertex_hash: Hash, ledger: LedgerHeader) -> Self {
        Self {
            view,
            vertex_hash,
            ledger,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.view.0.to_le_bytes());
        out.extend_from_slice(self.vertex_hash.as_bytes());
        self.ledger.encode_into(out);
    }
}

/// A proposed batch of commands extending the chain certified by `parent_qc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    pub epoch: EpochId,
    pub view: View,
    pub parent_qc: QuorumCertificate,
    /// `None` only for an epoch's genesis vertex.
    pub proposer: Option<ValidatorId>,
    pub commands: Vec<Command>,
    /// Empty vertex built locally by a replica that timed out.
    pub is_timeout: bool,
}

impl Vertex {
    /// Genesis vertex of an epoch, anchored at `ledger`.
    pub fn genesis(ledger: &LedgerHeader) -> Self {
        let anchor = BftHeader::new(View::GENESIS, Hash::ZERO, ledger.clone());
        Self {
            epoch: ledger.epoch,
            view: View::GENESIS,
            parent_qc: QuorumCertificate::unsigned(anchor.clone(), anchor, None),
            proposer: None,
            commands: Vec::new(),
            is_timeout: false,
        }
    }

    /// Regular proposal.
    pub fn new_proposal(
        parent_qc: QuorumCertificate,
        view: View,
        proposer: ValidatorId,
        commands: Vec<Command>,
    ) -> Self {
        Self {
            epoch: parent_qc.epoch(),
            view,
            parent_qc,
            proposer: Some(proposer),
            commands,
            is_timeout: false,
        }
    }

    /// Empty vertex a replica votes for when it times out without having
    /// voted in `view`. Every honest replica with the same highest QC builds
    /// the same vertex.
    pub fn new_timeout(parent_qc: QuorumCertificate, view: View, leader: ValidatorId) -> Self {
        Self {
            epoch: parent_qc.epoch(),
            view,
            parent_qc,
            proposer: Some(leader),
            commands: Vec::new(),
            is_timeout: true,
        }
    }

    /// Content hash. Signatures inside the parent QC are not covered.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(DOMAIN_VERTEX);
        buf.extend_from_slice(&self.epoch.0.to_le_bytes());
        buf.extend_from_slice(&self.view.0.to_le_bytes());
        self.parent_qc.vote_data.encode_into(&mut buf);
        match self.proposer {
            Some(id) => {
                buf.push(1);
                buf.extend_from_slice(&id.0.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&(self.commands.len() as u64).to_le_bytes());
        for cmd in &self.commands {
            buf.extend_from_slice(&(cmd.0.len() as u64).to_le_bytes());
            buf.extend_from_slice(&cmd.0);
        }
        buf.push(self.is_timeout as u8);
        Hash::from_bytes(&buf)
    }

    pub fn is_genesis(&self) -> bool {
        self.view.is_genesis()
    }

    /// Hash of the parent vertex.
    pub fn parent_hash(&self) -> Hash {
        self.parent_qc.vertex_hash()
    }

    pub fn parent_view(&self) -> View {
        self.parent_qc.view()
    }

    /// Ledger header of the parent vertex.
    pub fn parent_ledger(&self) -> &LedgerHeader {
        &self.parent_qc.proposed().ledger
    }
}

/// A vertex together with the ledger header `prepare` produced for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedVertex {
    pub vertex: Vertex,
    pub hash: Hash,
    pub ledger: LedgerHeader,
}

impl PreparedVertex {
    pub fn new(vertex: Vertex, ledger: LedgerHeader) -> Self {
        let hash = vertex.hash();
        Self {
            vertex,
            hash,
            ledger,
        }
    }

    pub fn view(&self) -> View {
        self.vertex.view
    }

    pub fn header(&self) -> BftHeader {
        BftHeader::new(self.vertex.view, self.hash, self.ledger.clone())
    }
}
