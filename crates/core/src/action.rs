//! Action types for the deterministic state machine.

use crate::{ConsensusMessage, Event, TimerId};
use concord_types::{EpochId, PreparedVertex, QuorumCertificate, ValidatorId, ValidatorSet};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to one validator. No delivery or ordering guarantee.
    Send {
        to: ValidatorId,
        message: ConsensusMessage,
    },

    /// Send a message to every other node.
    Broadcast { message: ConsensusMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration, replacing any timer with the
    /// same id.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Used to replay events that were deferred until a missing ancestor
    /// arrived.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Vertices committed by `proof`, in ancestor-to-descendant order.
    ///
    /// The ledger executor has already applied them.
    EmitCommitted {
        vertices: Vec<PreparedVertex>,
        proof: QuorumCertificate,
    },

    /// The replica moved to a new epoch.
    EmitEpochChange {
        epoch: EpochId,
        validators: ValidatorSet,
    },

    /// Safety state could not be persisted. The replica stops processing.
    Halt { reason: String },
}

impl Action {
    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Send { .. } => "Send",
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::EmitCommitted { .. } => "EmitCommitted",
            Action::EmitEpochChange { .. } => "EmitEpochChange",
            Action::Halt { .. } => "Halt",
        }
    }
}
