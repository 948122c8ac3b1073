//! Node composition for Concord consensus.
//!
//! Consensus runs one [`concord_bft::BftState`] per epoch. This crate owns
//! the epoch lifecycle and the top-level state machine handed to runners:
//!
//! - [`EpochManager`]: Detects committed end-of-epoch vertices, rebases the
//!   safety state and starts the next epoch. Answers peers stuck in the
//!   previous epoch with an [`EpochProof`].
//! - [`NodeStateMachine`]: Implements `StateMachine` for runners and stops
//!   processing for good once the replica halts.
//! - [`NodeBuilder`]: Assembles a node from its configuration and
//!   collaborators, reloading any persisted safety state.

mod builder;
mod epoch_manager;
mod state;

#[cfg(test)]
mod test_support;

pub use builder::{NodeBuilder, NodeConfig, NodeError};
pub use epoch_manager::{EpochManager, EpochProof};
pub use state::NodeStateMachine;
