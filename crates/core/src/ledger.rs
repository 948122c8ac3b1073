//! Ledger collaborators.

use concord_types::{Command, LedgerHeader, PreparedVertex, QuorumCertificate, Vertex, View};

/// Errors reported by the ledger executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("vertex rejected: {0}")]
    Rejected(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// Speculative execution and durable commit of vertices.
///
/// Implementations use interior mutability; the state machine holds them
/// behind an `Arc`.
pub trait LedgerExecutor: Send + Sync {
    /// Execute `vertex` on top of `parent` without side effects.
    fn prepare(&self, parent: &LedgerHeader, vertex: &Vertex) -> Result<LedgerHeader, LedgerError>;

    /// Durably apply committed vertices, ancestor first.
    fn commit(&self, vertices: &[PreparedVertex], proof: &QuorumCertificate)
        -> Result<(), LedgerError>;
}

/// Supplies commands for new proposals.
pub trait CommandSource: Send + Sync {
    /// Commands for a proposal in `view`. `uncommitted` is the chain from the
    /// root (exclusive) to the parent, so already-proposed commands can be
    /// skipped.
    fn next_commands(&self, view: View, uncommitted: &[PreparedVertex]) -> Vec<Command>;
}
