//! Deterministic simulation harness for Concord consensus.
//!
//! Runs any number of [`concord_node::NodeStateMachine`]s against one
//! explicitly stepped event queue and a simulated network:
//!
//! - [`SimulationRunner`]: Owns the nodes, the queue and the collaborators.
//!   `next_event()` and `step()` expose the queue to the caller;
//!   `run_until()` drives it to a deadline.
//! - [`SimulatedNetwork`]: Latency with jitter, packet loss, partitions and
//!   [`MessageMutator`]s that drop, delay or rewrite individual messages.
//! - [`SimLedger`], [`SimSafetyStore`], [`SimCommandSource`]: In-memory
//!   collaborators. Safety stores survive crashes so restarts recover.
//!
//! The same seed always reproduces the same run.

mod event_queue;
mod network;
mod runner;
mod storage;

/// Index of a simulated node. Node `i` runs as `ValidatorId(i)`.
pub type NodeIndex = u32;

pub use event_queue::EventKey;
pub use network::{Delivery, MessageInfo, MessageMutator, NetworkConfig, SimulatedNetwork};
pub use runner::{CommittedVertex, SimulationConfig, SimulationRunner, SimulationStats};
pub use storage::{SimCommandSource, SimLedger, SimSafetyStore};
