//! Shared fixtures for unit tests.

use crate::EpochManager;
use concord_bft::{BftConfig, ReplicaContext};
use concord_core::{
    Action, CommandSource, ConsensusMessage, Event, LedgerError, LedgerExecutor, PersistenceError,
    SafetyStateStore, TimerId,
};
use concord_types::{
    Command, EpochId, Hash, KeyPair, LedgerHeader, PreparedVertex, QuorumCertificate,
    SafetyState, ValidatorId, ValidatorSet, Vertex, View,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Ledger that ends epoch 0 once `epoch_length` commands were prepared.
pub(crate) struct EpochLedger {
    epoch_length: u64,
    next: ValidatorSet,
}

impl EpochLedger {
    pub(crate) fn new(epoch_length: u64, next: ValidatorSet) -> Self {
        Self { epoch_length, next }
    }
}

impl LedgerExecutor for EpochLedger {
    fn prepare(&self, parent: &LedgerHeader, vertex: &Vertex) -> Result<LedgerHeader, LedgerError> {
        if parent.is_end_of_epoch() {
            return Ok(parent.clone());
        }
        let state_version = parent.state_version + vertex.commands.len() as u64;
        let ends = parent.epoch == EpochId(0) && state_version >= self.epoch_length;
        Ok(LedgerHeader {
            epoch: parent.epoch,
            state_version,
            accumulator: Hash::from_parts(&[parent.accumulator.as_bytes(), vertex.hash().as_bytes()]),
            next_validators: ends.then(|| self.next.clone()),
        })
    }

    fn commit(&self, _vertices: &[PreparedVertex], _proof: &QuorumCertificate) -> Result<(), LedgerError> {
        Ok(())
    }
}

pub(crate) struct TestCommands;

impl CommandSource for TestCommands {
    fn next_commands(&self, view: View, _uncommitted: &[PreparedVertex]) -> Vec<Command> {
        vec![Command::new(view.0.to_be_bytes())]
    }
}

#[derive(Default)]
pub(crate) struct MemSafetyStore {
    pub(crate) saved: Mutex<Option<SafetyState>>,
    pub(crate) fail: std::sync::atomic::AtomicBool,
}

impl SafetyStateStore for MemSafetyStore {
    fn load(&self) -> Result<Option<SafetyState>, PersistenceError> {
        Ok(self.saved.lock().clone())
    }

    fn store(&self, state: &SafetyState) -> Result<(), PersistenceError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("disk full".into()));
        }
        *self.saved.lock() = Some(state.clone());
        Ok(())
    }
}

pub(crate) fn config() -> BftConfig {
    BftConfig::default().with_base_timeout(Duration::from_millis(100))
}

pub(crate) fn context(id: u64, key: KeyPair, ledger: Arc<dyn LedgerExecutor>) -> ReplicaContext {
    ReplicaContext {
        self_id: ValidatorId(id),
        key,
        ledger,
        commands: Arc::new(TestCommands),
        safety_store: Arc::new(MemSafetyStore::default()),
        config: config(),
    }
}

/// What happened during a [`pump`] run, per replica.
#[derive(Debug, Default)]
pub(crate) struct PumpLog {
    pub(crate) committed: Vec<Vec<(EpochId, View)>>,
    pub(crate) epoch_changes: Vec<Vec<EpochId>>,
}

/// Deliver messages instantly. Timers fire only when no message is in
/// flight, in (replica, timer) order. Stops after `budget` events.
///
/// `drop(from, to, message)` filters deliveries.
pub(crate) fn pump(
    nodes: &mut [EpochManager],
    initial: Vec<(usize, Event)>,
    budget: usize,
    drop: impl Fn(usize, usize, &ConsensusMessage) -> bool,
) -> PumpLog {
    let n = nodes.len();
    let mut log = PumpLog {
        committed: vec![vec![]; n],
        epoch_changes: vec![vec![]; n],
    };
    let mut queue: VecDeque<(usize, Event)> = initial.into();
    let mut timers: BTreeSet<(usize, TimerId)> = BTreeSet::new();

    for _ in 0..budget {
        let Some((node, event)) = queue.pop_front().or_else(|| {
            let next = timers.pop_first()?;
            Some((next.0, timer_event(next.1)))
        }) else {
            break;
        };

        for action in nodes[node].handle(event) {
            match action {
                Action::Send { to, message } => {
                    let to = to.0 as usize;
                    if !drop(node, to, &message) {
                        queue.push_back((
                            to,
                            Event::MessageReceived {
                                sender: ValidatorId(node as u64),
                                message,
                            },
                        ));
                    }
                }
                Action::Broadcast { message } => {
                    for to in (0..n).filter(|to| *to != node) {
                        if !drop(node, to, &message) {
                            queue.push_back((
                                to,
                                Event::MessageReceived {
                                    sender: ValidatorId(node as u64),
                                    message: message.clone(),
                                },
                            ));
                        }
                    }
                }
                Action::SetTimer { id, .. } => {
                    timers.insert((node, id));
                }
                Action::CancelTimer { id } => {
                    timers.remove(&(node, id));
                }
                Action::EnqueueInternal { event } => queue.push_front((node, event)),
                Action::EmitCommitted { vertices, .. } => log.committed[node]
                    .extend(vertices.iter().map(|v| (v.vertex.epoch, v.view()))),
                Action::EmitEpochChange { epoch, .. } => log.epoch_changes[node].push(epoch),
                Action::Halt { .. } => {}
            }
        }
    }
    log
}

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::LocalTimeout { epoch, view } => Event::LocalTimeout { epoch, view },
        TimerId::SyncRetry { epoch, vertex_hash } => Event::SyncTimeout { epoch, vertex_hash },
    }
}
