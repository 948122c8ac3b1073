//! Deterministic event ordering.

use crate::NodeIndex;
use concord_core::{Event, EventPriority};
use std::time::Duration;

/// Key for ordering events in the simulation queue.
///
/// Events are ordered by:
/// 1. Time (earlier first)
/// 2. Priority (internal before timer before network)
/// 3. Node index (lower first)
/// 4. Sequence number (insertion order)
///
/// Together these give a total order, so the same seed always replays the
/// same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node_index: NodeIndex,
    pub sequence: u64,
}

impl EventKey {
    pub fn new(time: Duration, event: &Event, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node_index,
            sequence,
        }
    }

    /// Key for an event re-enqueued by the node itself, ahead of anything
    /// else at the same instant.
    pub fn internal(time: Duration, node_index: NodeIndex, sequence: u64) -> Self {
        Self {
            time,
            priority: EventPriority::Internal,
            node_index,
            sequence,
        }
    }
}
