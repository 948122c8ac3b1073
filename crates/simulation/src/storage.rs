//! In-memory collaborators for simulated nodes.
//!
//! Each node gets its own ledger and safety store. The safety store is held
//! by the runner across crashes so a restarted node recovers what it
//! persisted.

use concord_core::{
    CommandSource, LedgerError, LedgerExecutor, PersistenceError, SafetyStateStore,
};
use concord_types::{
    Command, Hash, LedgerHeader, PreparedVertex, QuorumCertificate, SafetyState, ValidatorSet,
    Vertex, View,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Deterministic ledger: every command bumps the state version and the
/// accumulator chains vertex hashes.
///
/// An epoch ends at the first vertex whose view reaches `epoch_length`.
/// The next epoch keeps the same validator set. Once a branch has ended its
/// epoch, further vertices on it leave the ledger unchanged.
#[derive(Debug)]
pub struct SimLedger {
    /// Views per epoch. Zero disables epoch changes.
    epoch_length: u64,
    validators: ValidatorSet,
    committed_vertices: AtomicU64,
    committed_version: AtomicU64,
    fail_commits: AtomicBool,
}

impl SimLedger {
    pub fn new(epoch_length: u64, validators: ValidatorSet) -> Self {
        Self {
            epoch_length,
            validators,
            committed_vertices: AtomicU64::new(0),
            committed_version: AtomicU64::new(0),
            fail_commits: AtomicBool::new(false),
        }
    }

    pub fn committed_vertices(&self) -> u64 {
        self.committed_vertices.load(Ordering::SeqCst)
    }

    /// State version of the last committed vertex.
    pub fn committed_version(&self) -> u64 {
        self.committed_version.load(Ordering::SeqCst)
    }

    /// Make every later commit fail.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl LedgerExecutor for SimLedger {
    fn prepare(&self, parent: &LedgerHeader, vertex: &Vertex) -> Result<LedgerHeader, LedgerError> {
        if parent.is_end_of_epoch() {
            return Ok(parent.clone());
        }
        let ends = self.epoch_length > 0 && vertex.view.0 >= self.epoch_length;
        Ok(LedgerHeader {
            epoch: parent.epoch,
            state_version: parent.state_version + vertex.commands.len() as u64,
            accumulator: Hash::from_parts(&[
                parent.accumulator.as_bytes(),
                vertex.hash().as_bytes(),
            ]),
            next_validators: ends.then(|| self.validators.clone()),
        })
    }

    fn commit(
        &self,
        vertices: &[PreparedVertex],
        _proof: &QuorumCertificate,
    ) -> Result<(), LedgerError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(LedgerError::CommitFailed("injected failure".into()));
        }
        self.committed_vertices
            .fetch_add(vertices.len() as u64, Ordering::SeqCst);
        if let Some(last) = vertices.last() {
            self.committed_version
                .store(last.ledger.state_version, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Safety store that survives node restarts inside one simulation.
#[derive(Debug, Default)]
pub struct SimSafetyStore {
    state: Mutex<Option<SafetyState>>,
    writes: AtomicU64,
    fail: AtomicBool,
}

impl SimSafetyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// The last stored state.
    pub fn snapshot(&self) -> Option<SafetyState> {
        self.state.lock().clone()
    }

    /// Make every later write fail, as a full disk would.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl SafetyStateStore for SimSafetyStore {
    fn load(&self) -> Result<Option<SafetyState>, PersistenceError> {
        Ok(self.snapshot())
    }

    fn store(&self, state: &SafetyState) -> Result<(), PersistenceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("injected write failure".into()));
        }
        *self.state.lock() = Some(state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Produces `batch_size` unique commands per proposal.
#[derive(Debug, Clone)]
pub struct SimCommandSource {
    node: u32,
    batch_size: usize,
}

impl SimCommandSource {
    pub fn new(node: u32, batch_size: usize) -> Self {
        Self { node, batch_size }
    }
}

impl CommandSource for SimCommandSource {
    fn next_commands(&self, view: View, _uncommitted: &[PreparedVertex]) -> Vec<Command> {
        (0..self.batch_size as u32)
            .map(|i| {
                let mut bytes = Vec::with_capacity(16);
                bytes.extend_from_slice(&self.node.to_le_bytes());
                bytes.extend_from_slice(&view.0.to_le_bytes());
                bytes.extend_from_slice(&i.to_le_bytes());
                Command::new(bytes)
            })
            .collect()
    }
}
