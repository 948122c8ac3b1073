//! Node state machine.

use crate::EpochManager;
use concord_bft::BftStats;
use concord_core::{Action, ConsensusMessage, Event, StateMachine};
use concord_types::{EpochId, ValidatorId, View};
use std::time::Duration;
use tracing::{error, trace};

/// Combined node state machine.
///
/// Wraps the [`EpochManager`] and adds the halted state: once safety state
/// fails to persist, every later event is ignored.
pub struct NodeStateMachine {
    epochs: EpochManager,

    /// Why the node stopped, if it did.
    halted: Option<String>,

    /// Current time.
    now: Duration,
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("epochs", &self.epochs)
            .field("halted", &self.halted)
            .field("now", &self.now)
            .finish()
    }
}

impl NodeStateMachine {
    pub fn new(epochs: EpochManager) -> Self {
        Self {
            epochs,
            halted: None,
            now: Duration::ZERO,
        }
    }

    pub fn validator_id(&self) -> ValidatorId {
        self.epochs.self_id()
    }

    pub fn epoch(&self) -> EpochId {
        self.epochs.epoch()
    }

    /// Get a reference to the epoch manager.
    pub fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    pub fn stats(&self) -> BftStats {
        self.epochs.stats()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Host entry points
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start the replica in its current epoch.
    pub fn start(&mut self) -> Vec<Action> {
        self.handle(Event::Start)
    }

    /// Process a message received from `sender`.
    pub fn process_message(&mut self, sender: ValidatorId, message: ConsensusMessage) -> Vec<Action> {
        self.handle(Event::MessageReceived { sender, message })
    }

    /// A view timer armed through `Action::SetTimer` fired.
    pub fn on_local_timer_fire(&mut self, epoch: EpochId, view: View) -> Vec<Action> {
        self.handle(Event::LocalTimeout { epoch, view })
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.halted.is_some() {
            trace!(event = event.type_name(), "Node halted, ignoring event");
            return vec![];
        }

        let mut actions = self.epochs.handle(event);
        if let Some(pos) = actions
            .iter()
            .position(|a| matches!(a, Action::Halt { .. }))
        {
            actions.truncate(pos + 1);
            if let Some(Action::Halt { reason }) = actions.last() {
                error!(validator = %self.epochs.self_id(), reason = %reason, "Node halted");
                self.halted = Some(reason.clone());
            }
        }
        actions
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.epochs.set_time(now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config, EpochLedger, MemSafetyStore, TestCommands};
    use concord_bft::ReplicaContext;
    use concord_types::test_utils::{genesis_ledger, validator_set};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn node(store: Arc<MemSafetyStore>) -> NodeStateMachine {
        let (validators, keys) = validator_set(&[1, 1, 1, 1]);
        // Replica 1 leads view 1.
        let ctx = ReplicaContext {
            self_id: ValidatorId(2),
            key: keys[2].clone(),
            ledger: Arc::new(EpochLedger::new(100, validators.clone())),
            commands: Arc::new(TestCommands),
            safety_store: store,
            config: config(),
        };
        let epochs =
            EpochManager::new(ctx, genesis_ledger(EpochId(0)), validators, None).unwrap();
        NodeStateMachine::new(epochs)
    }

    #[test]
    fn test_start_arms_first_view_timer() {
        let mut node = node(Arc::new(MemSafetyStore::default()));
        let actions = node.start();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer { id: concord_core::TimerId::LocalTimeout { view: View(1), .. }, .. }
        )));
        assert_eq!(node.stats().current_view, 1);
    }

    #[traced_test]
    #[test]
    fn test_halts_on_persistence_failure_and_ignores_later_events() {
        let store = Arc::new(MemSafetyStore::default());
        let mut node = node(store.clone());
        node.start();
        store.fail.store(true, Ordering::SeqCst);

        let actions = node.on_local_timer_fire(EpochId(0), View(1));
        assert!(matches!(actions.last(), Some(Action::Halt { .. })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { .. })));
        assert!(node.is_halted());
        assert!(node.halt_reason().unwrap().contains("disk full"));
        assert!(logs_contain("Node halted"));

        store.fail.store(false, Ordering::SeqCst);
        assert!(node.on_local_timer_fire(EpochId(0), View(1)).is_empty());
        assert!(node.start().is_empty());
    }

    #[test]
    fn test_timer_fire_broadcasts_timeout() {
        let store = Arc::new(MemSafetyStore::default());
        let mut node = node(store.clone());
        node.start();
        let actions = node.on_local_timer_fire(EpochId(0), View(1));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast {
                message: ConsensusMessage::Timeout(_)
            }
        )));
        let saved = store.saved.lock().clone().unwrap();
        assert_eq!(saved.last_voted_view, View(1));
        assert!(saved.last_vote.unwrap().is_timeout());
        // Timers for other epochs are dropped.
        assert!(node.on_local_timer_fire(EpochId(4), View(1)).is_empty());
    }
}
