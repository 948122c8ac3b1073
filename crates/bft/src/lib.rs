//! BFT consensus state machine.
//!
//! This crate provides a synchronous HotStuff-style consensus core that can
//! be driven by both the deterministic simulation and the production runner.
//!
//! # Architecture
//!
//! [`BftState`] owns one epoch's worth of consensus state and reduces events
//! to actions:
//!
//! - `Event::Start` → arm the first view timer, propose if leading
//! - `ConsensusMessage::Proposal` → apply certificates, insert, vote
//! - `ConsensusMessage::Vote` → collect votes, form a QC when quorum is reached
//! - `ConsensusMessage::Timeout` → collect timeout votes, form a TC
//! - `Event::LocalTimeout` → broadcast a timeout vote for the current view
//!
//! All I/O is performed by the runner via returned `Action`s.
//!
//! # Terminology
//!
//! - **View**: Attempt number within an epoch. Each view has one leader
//!   chosen by weighted round robin.
//!
//! - **Vertex**: A proposed node of the block tree. Carries the QC on its
//!   parent and a batch of opaque commands.
//!
//! - **QC (Quorum Certificate)**: Signatures from more than two thirds of the
//!   voting power on one vertex.
//!
//! - **TC (Timeout Certificate)**: Signatures from more than two thirds of
//!   the voting power abandoning one view.
//!
//! # Consensus Protocol
//!
//! ## Safety
//!
//! - **Vote once**: A replica votes at most once per view. The vote is only
//!   released after the updated safety state is durable.
//!
//! - **Locking**: Voting for a vertex locks on its parent QC. A replica never
//!   votes for a vertex whose parent QC is older than its lock.
//!
//! - **Two-chain commit**: A vertex is committed when a QC forms on a child
//!   from the directly following view.
//!
//! ## Liveness
//!
//! - **Pacemaker**: Every view has a countdown with exponential backoff.
//!   Expiry broadcasts a timeout vote; a TC moves everyone to the next view.
//!
//! - **View synchronization**: Any QC or TC for view `v` moves a replica to
//!   `v + 1`, and every view change sends the replica's certificates to the
//!   new leader.
//!
//! - **Sync**: Certificates naming unknown vertices trigger a fetch of the
//!   missing ancestors before the certificate is applied.

mod config;
mod pacemaker;
mod pending_votes;
mod proposer_election;
mod safety_rules;
mod state;
mod sync;
mod vertex_store;

#[cfg(test)]
mod test_support;

pub use config::{BftConfig, ConfigError};
pub use pacemaker::{AdvanceReason, Pacemaker, PacemakerPhase};
pub use pending_votes::{PendingVotes, PendingVotesError, VoteOutcome};
pub use proposer_election::ProposerElection;
pub use safety_rules::{SafetyError, SafetyRules};
pub use state::{BftState, BftStats, ReplicaContext};
pub use sync::{MissingVertex, VertexSync};
pub use vertex_store::{VertexStore, VertexStoreError};
