//! Core types for Concord consensus.
//!
//! This crate provides the foundational types for the consensus architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait that all state machines implement
//! - [`LedgerExecutor`], [`CommandSource`], [`SafetyStateStore`]: the
//!   collaborators the state machine is constructed with
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, performs no network I/O
//!
//! The only blocking calls are to the injected collaborators: speculative
//! execution, commit, and the durable write of safety state before a vote
//! is released.

mod action;
mod event;
mod ledger;
mod message;
mod storage;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use ledger::{CommandSource, LedgerError, LedgerExecutor};
pub use message::ConsensusMessage;
pub use storage::{PersistenceError, SafetyStateStore};
pub use traits::{StateMachine, SubStateMachine};

use concord_types::{EpochId, Hash, View};

/// Timer identification.
///
/// Setting a timer replaces any pending timer with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Pacemaker timeout for a view.
    LocalTimeout { epoch: EpochId, view: View },
    /// Retry of an outstanding vertex sync request.
    SyncRetry { epoch: EpochId, vertex_hash: Hash },
}
