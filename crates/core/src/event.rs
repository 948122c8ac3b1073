//! Event types for the deterministic state machine.

use crate::ConsensusMessage;
use concord_types::{EpochId, Hash, ValidatorId, View};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// Start the replica: arm the first view timer and propose if leading.
    Start,

    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The pacemaker timer for `view` fired.
    LocalTimeout { epoch: EpochId, view: View },

    /// An outstanding sync request went unanswered.
    SyncTimeout { epoch: EpochId, vertex_hash: Hash },

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A consensus message arrived from `sender`.
    MessageReceived {
        sender: ValidatorId,
        message: ConsensusMessage,
    },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::Start => EventPriority::Internal,
            Event::LocalTimeout { .. } | Event::SyncTimeout { .. } => EventPriority::Timer,
            Event::MessageReceived { .. } => EventPriority::Network,
        }
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Start => "Start",
            Event::LocalTimeout { .. } => "LocalTimeout",
            Event::SyncTimeout { .. } => "SyncTimeout",
            Event::MessageReceived { message, .. } => message.type_name(),
        }
    }
}
