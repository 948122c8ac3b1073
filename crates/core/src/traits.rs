//! State machine traits.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic state machine driven by events.
///
/// Implementations must not read the wall clock; time is injected through
/// [`StateMachine::set_time`] before each event.
pub trait StateMachine {
    /// Process one event to completion and return the resulting actions.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current time.
    fn set_time(&mut self, now: Duration);

    /// Current time as last set.
    fn now(&self) -> Duration;
}

/// A component that handles a subset of events.
pub trait SubStateMachine {
    /// Handle the event if it belongs to this component.
    ///
    /// Returns `None` when the event is not for this component.
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>>;

    /// Set the current time.
    fn set_time(&mut self, now: Duration);
}
