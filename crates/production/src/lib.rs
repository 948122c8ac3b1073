//! Production runner with async I/O.
//!
//! Wraps the deterministic [`concord_node::NodeStateMachine`] with real
//! clocks, timers, networking and durable storage:
//!
//! - [`ProductionRunner`]: A single tokio task owns the state machine and
//!   receives events over channels. This avoids mutex contention.
//! - [`TimerManager`]: One tokio task per armed timer.
//! - [`FileSafetyStore`]: Safety state persisted as JSON with an atomic
//!   replace, durable before the vote it protects leaves the node.
//! - [`Transport`]: The outbound network seam. [`ChannelNetwork`] wires
//!   runners together inside one process.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ProductionRunner                                        │
//! │    loop { event = select(shutdown, timers, inbound);     │
//! │           actions = state.handle(event); }               │
//! │         │                 │                  │           │
//! │         ▼                 ▼                  ▼           │
//! │    TimerManager       Transport      notifications (mpsc)│
//! └──────────────────────────────────────────────────────────┘
//! ```

mod network;
mod runner;
mod storage;
mod timers;

pub use network::{ChannelNetwork, ChannelTransport, InboundMessage, Transport, TransportError};
pub use runner::{
    NodeNotification, ProductionRunner, ProductionRunnerBuilder, RunnerError, ShutdownHandle,
};
pub use storage::FileSafetyStore;
pub use timers::TimerManager;
