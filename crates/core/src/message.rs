//! Consensus message types.

use concord_types::{EpochId, Hash, HighQc, Proposal, Vertex, View, Vote};

/// Every message replicas exchange.
///
/// Each variant is tagged with the epoch it belongs to so the epoch manager
/// can route or drop it before any component sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    // ═══════════════════════════════════════════════════════════════════════
    // BFT
    // ═══════════════════════════════════════════════════════════════════════
    /// Leader proposal for a view.
    Proposal(Proposal),

    /// Vote sent to the next view's leader.
    Vote(Vote),

    /// Timeout vote, broadcast to all.
    Timeout(Vote),

    /// Hint that the sender entered `view`, carrying its certificates.
    ViewUpdate {
        epoch: EpochId,
        view: View,
        high_qc: HighQc,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════
    /// Ask for `count` vertices ending at `vertex_hash`, walking to parents.
    SyncRequest {
        epoch: EpochId,
        vertex_hash: Hash,
        count: usize,
    },

    /// Vertices in descendant-to-ancestor order.
    SyncResponse {
        epoch: EpochId,
        vertices: Vec<Vertex>,
    },
}

impl ConsensusMessage {
    /// Epoch the message belongs to.
    pub fn epoch(&self) -> EpochId {
        match self {
            ConsensusMessage::Proposal(p) => p.epoch(),
            ConsensusMessage::Vote(v) | ConsensusMessage::Timeout(v) => v.epoch(),
            ConsensusMessage::ViewUpdate { epoch, .. }
            | ConsensusMessage::SyncRequest { epoch, .. }
            | ConsensusMessage::SyncResponse { epoch, .. } => *epoch,
        }
    }

    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "Proposal",
            ConsensusMessage::Vote(_) => "Vote",
            ConsensusMessage::Timeout(_) => "Timeout",
            ConsensusMessage::ViewUpdate { .. } => "ViewUpdate",
            ConsensusMessage::SyncRequest { .. } => "SyncRequest",
            ConsensusMessage::SyncResponse { .. } => "SyncResponse",
        }
    }

    /// Check if this is a sync message.
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            ConsensusMessage::SyncRequest { .. } | ConsensusMessage::SyncResponse { .. }
        )
    }
}
