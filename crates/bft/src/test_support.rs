//! Shared fixtures for unit tests.

use crate::VertexStore;
use concord_core::{
    CommandSource, LedgerError, LedgerExecutor, PersistenceError, SafetyStateStore,
};
use concord_types::test_utils::{keypair, signed_qc, validator_set};
use concord_types::{
    timeout_message, vote_message, BftHeader, Command, Hash, HighQc, KeyPair, LedgerHeader,
    PreparedVertex, QuorumCertificate, SafetyState, ValidatorId, Vertex, View, Vote, VoteData,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ledger that folds vertex hashes into the accumulator.
#[derive(Default)]
pub(crate) struct TestLedger {
    reject_tag: Option<u8>,
    committed: Mutex<Vec<View>>,
}

impl TestLedger {
    /// Ledger that rejects any vertex carrying the single-byte command `tag`.
    pub(crate) fn rejecting_tag(tag: u8) -> Self {
        Self {
            reject_tag: Some(tag),
            ..Self::default()
        }
    }

    pub(crate) fn committed_views(&self) -> Vec<View> {
        self.committed.lock().clone()
    }
}

impl LedgerExecutor for TestLedger {
    fn prepare(&self, parent: &LedgerHeader, vertex: &Vertex) -> Result<LedgerHeader, LedgerError> {
        if let Some(tag) = self.reject_tag {
            if vertex.commands.iter().any(|c| c.as_bytes() == [tag]) {
                return Err(LedgerError::Rejected(format!("tag {tag}")));
            }
        }
        Ok(LedgerHeader {
            epoch: parent.epoch,
            state_version: parent.state_version + vertex.commands.len() as u64,
            accumulator: Hash::from_parts(&[
                parent.accumulator.as_bytes(),
                vertex.hash().as_bytes(),
            ]),
            next_validators: None,
        })
    }

    fn commit(&self, vertices: &[PreparedVertex], _proof: &QuorumCertificate) -> Result<(), LedgerError> {
        self.committed
            .lock()
            .extend(vertices.iter().map(|v| v.view()));
        Ok(())
    }
}

/// Safety store that keeps every write and can be told to fail.
#[derive(Default)]
pub(crate) struct MemSafetyStore {
    pub(crate) saved: Mutex<Vec<SafetyState>>,
    pub(crate) fail: AtomicBool,
}

impl SafetyStateStore for MemSafetyStore {
    fn load(&self) -> Result<Option<SafetyState>, PersistenceError> {
        Ok(self.saved.lock().last().cloned())
    }

    fn store(&self, state: &SafetyState) -> Result<(), PersistenceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("disk full".into()));
        }
        self.saved.lock().push(state.clone());
        Ok(())
    }
}

/// One command per view, carrying the view number.
pub(crate) struct TestCommands;

impl CommandSource for TestCommands {
    fn next_commands(&self, view: View, _uncommitted: &[PreparedVertex]) -> Vec<Command> {
        vec![Command::new(view.0.to_be_bytes())]
    }
}

pub(crate) fn ledger() -> Arc<TestLedger> {
    Arc::new(TestLedger::default())
}

pub(crate) fn genesis() -> (PreparedVertex, QuorumCertificate) {
    let ledger = LedgerHeader::genesis();
    let prepared = PreparedVertex::new(Vertex::genesis(&ledger), ledger);
    let qc = QuorumCertificate::genesis(prepared.header());
    (prepared, qc)
}

pub(crate) fn genesis_store(ledger: Arc<TestLedger>) -> (VertexStore, QuorumCertificate) {
    let (prepared, qc) = genesis();
    (VertexStore::new(prepared, qc.clone(), ledger, 100), qc)
}

pub(crate) fn sign_qc(data: VoteData, keys: &[KeyPair]) -> QuorumCertificate {
    signed_qc(&data, keys)
}

/// QC from all four test validators on a vertex held by `store`.
pub(crate) fn qc_on(store: &VertexStore, header: &BftHeader) -> QuorumCertificate {
    let (_, keys) = validator_set(&[1, 1, 1, 1]);
    let data = store.vote_data_for(header).unwrap();
    signed_qc(&data, &keys)
}

/// Signed vote by test validator `author`.
pub(crate) fn vote(author: u64, data: &VoteData, high_qc: HighQc) -> Vote {
    let key = keypair(author);
    let timestamp_ms = 500 + author;
    Vote {
        author: ValidatorId(author),
        vote_data: data.clone(),
        timestamp_ms,
        signature: key.sign(&vote_message(&data.hash(), timestamp_ms)),
        high_qc,
        timeout_signature: None,
    }
}

/// Signed timeout vote by test validator `author`.
pub(crate) fn timeout_vote(author: u64, data: &VoteData, high_qc: HighQc) -> Vote {
    let mut v = vote(author, data, high_qc);
    v.timeout_signature = Some(keypair(author).sign(&timeout_message(data.epoch(), data.view())));
    v
}

/// Vote data for a fresh vertex at `view` extending genesis.
pub(crate) fn vote_data_at(view: u64, tag: &[u8]) -> VoteData {
    let (g, _) = genesis();
    VoteData::new(
        BftHeader::new(View(view), Hash::from_bytes(tag), g.ledger.clone()),
        g.header(),
    )
}
