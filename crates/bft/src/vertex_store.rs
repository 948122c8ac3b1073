//! Speculative vertex tree rooted at the last committed vertex.
//!
//! Every vertex in the store has been prepared by the ledger executor, and
//! its parent is either in the store or is the root. A QC whose vote data
//! names a committed header moves the root forward: the committed path is
//! handed to the executor in ancestor-to-descendant order and every branch
//! that does not descend from the new root is discarded.

use concord_core::{LedgerError, LedgerExecutor};
use concord_types::{
    BftHeader, EpochId, Hash, HighQc, PreparedVertex, QuorumCertificate, TimeoutCertificate,
    Vertex, View, VoteData,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Errors from vertex store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VertexStoreError {
    /// Parent not in the store; the caller should sync it.
    #[error("unknown parent {0}")]
    UnknownParent(Hash),
    /// QC for a vertex the store does not hold.
    #[error("unknown vertex {0}")]
    UnknownVertex(Hash),
    #[error("view {view} does not extend {floor}")]
    StaleView { view: View, floor: View },
    #[error("certificate does not match the stored vertex {0}")]
    QcMismatch(Hash),
    #[error("vertex for {actual}, store is at {expected}")]
    WrongEpoch { expected: EpochId, actual: EpochId },
    #[error("ledger rejected vertex: {0}")]
    LedgerRejected(LedgerError),
    #[error("ledger commit failed: {0}")]
    CommitFailed(LedgerError),
}

/// Store of uncommitted vertices for one epoch.
pub struct VertexStore {
    ledger: Arc<dyn LedgerExecutor>,
    root: PreparedVertex,
    vertices: HashMap<Hash, PreparedVertex>,
    children: HashMap<Hash, Vec<Hash>>,
    highest_qc: QuorumCertificate,
    highest_committed_qc: QuorumCertificate,
    highest_tc: Option<TimeoutCertificate>,
    /// Committed vertices kept to answer sync requests, oldest first.
    retained: HashMap<Hash, PreparedVertex>,
    retained_order: VecDeque<(View, Hash)>,
    retention_views: u64,
}

impl std::fmt::Debug for VertexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexStore")
            .field("root", &self.root.hash)
            .field("vertices", &self.vertices.len())
            .field("highest_qc_view", &self.highest_qc.view())
            .field("retained", &self.retained.len())
            .finish()
    }
}

impl VertexStore {
    /// Create a store rooted at an epoch's genesis vertex.
    pub fn new(
        genesis: PreparedVertex,
        genesis_qc: QuorumCertificate,
        ledger: Arc<dyn LedgerExecutor>,
        retention_views: u64,
    ) -> Self {
        let mut vertices = HashMap::new();
        vertices.insert(genesis.hash, genesis.clone());
        Self {
            ledger,
            root: genesis,
            vertices,
            children: HashMap::new(),
            highest_qc: genesis_qc.clone(),
            highest_committed_qc: genesis_qc,
            highest_tc: None,
            retained: HashMap::new(),
            retained_order: VecDeque::new(),
            retention_views,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    /// The last committed vertex.
    pub fn root(&self) -> &PreparedVertex {
        &self.root
    }

    pub fn epoch(&self) -> EpochId {
        self.root().vertex.epoch
    }

    pub fn get(&self, hash: &Hash) -> Option<&PreparedVertex> {
        self.vertices.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.vertices.contains_key(hash)
    }

    /// Number of uncommitted vertices, root included.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn highest_qc(&self) -> &QuorumCertificate {
        &self.highest_qc
    }

    pub fn highest_committed_qc(&self) -> &QuorumCertificate {
        &self.highest_committed_qc
    }

    pub fn highest_tc(&self) -> Option<&TimeoutCertificate> {
        self.highest_tc.as_ref()
    }

    /// Certificates this replica advertises.
    pub fn high_qc(&self) -> HighQc {
        HighQc {
            highest_qc: self.highest_qc.clone(),
            highest_committed_qc: self.highest_committed_qc.clone(),
            highest_tc: self.highest_tc.clone(),
        }
    }

    /// Number of children of `hash`.
    pub fn children_count(&self, hash: &Hash) -> usize {
        self.children.get(hash).map_or(0, Vec::len)
    }

    /// Vertex hash that must be fetched before `qc` can be applied.
    pub fn sync_needed(&self, qc: &QuorumCertificate) -> Option<Hash> {
        if qc.epoch() != self.epoch() || qc.view() <= self.root().view() {
            return None;
        }
        let hash = qc.vertex_hash();
        (!self.vertices.contains_key(&hash)).then_some(hash)
    }

    /// Vertices from the root (exclusive) to `hash` (inclusive), ancestor
    /// first. `None` if `hash` is not on a chain from the root.
    pub fn path_from_root(&self, hash: &Hash) -> Option<Vec<PreparedVertex>> {
        let mut path = Vec::new();
        let mut cursor = *hash;
        while cursor != self.root.hash {
            let vertex = self.vertices.get(&cursor)?;
            cursor = vertex.vertex.parent_hash();
            path.push(vertex.clone());
        }
        path.reverse();
        Some(path)
    }

    /// Up to `count` vertices starting at `hash` and walking to parents,
    /// descendant first. Serves recently committed vertices too. Genesis is
    /// never returned.
    pub fn get_vertices(&self, hash: &Hash, count: usize) -> Vec<Vertex> {
        let mut out = Vec::new();
        let mut cursor = *hash;
        while out.len() < count {
            let Some(prepared) = self
                .vertices
                .get(&cursor)
                .or_else(|| self.retained.get(&cursor))
            else {
                break;
            };
            if prepared.vertex.is_genesis() {
                break;
            }
            cursor = prepared.vertex.parent_hash();
            out.push(prepared.vertex.clone());
        }
        out
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Prepare and insert a vertex whose parent is already present.
    pub fn insert(&mut self, vertex: Vertex) -> Result<BftHeader, VertexStoreError> {
        let hash = vertex.hash();
        if let Some(existing) = self.vertices.get(&hash) {
            return Ok(existing.header());
        }
        let epoch = self.epoch();
        if vertex.epoch != epoch {
            return Err(VertexStoreError::WrongEpoch {
                expected: epoch,
                actual: vertex.epoch,
            });
        }
        let root_view = self.root().view();
        if vertex.view <= root_view {
            return Err(VertexStoreError::StaleView {
                view: vertex.view,
                floor: root_view,
            });
        }

        let parent_hash = vertex.parent_hash();
        let parent = self
            .vertices
            .get(&parent_hash)
            .ok_or(VertexStoreError::UnknownParent(parent_hash))?;
        if vertex.view <= parent.view() {
            return Err(VertexStoreError::StaleView {
                view: vertex.view,
                floor: parent.view(),
            });
        }
        if !Self::certifies(&vertex.parent_qc, parent) {
            return Err(VertexStoreError::QcMismatch(parent_hash));
        }

        let ledger = self
            .ledger
            .prepare(&parent.ledger, &vertex)
            .map_err(VertexStoreError::LedgerRejected)?;
        let prepared = PreparedVertex::new(vertex, ledger);
        let header = prepared.header();

        trace!(
            vertex = %hash,
            view = header.view.0,
            parent = %parent_hash,
            "Inserted vertex"
        );
        self.children.entry(parent_hash).or_default().push(hash);
        self.vertices.insert(hash, prepared);
        Ok(header)
    }

    /// Record a TC if it is the highest seen.
    pub fn insert_tc(&mut self, tc: TimeoutCertificate) {
        let higher = self
            .highest_tc
            .as_ref()
            .map_or(true, |current| tc.view > current.view);
        if higher {
            self.highest_tc = Some(tc);
        }
    }

    /// Apply a QC: update the highest QC and commit what it commits.
    ///
    /// Returns the newly committed vertices, ancestor first. The caller must
    /// have resolved [`VertexStore::sync_needed`] first.
    pub fn insert_qc(
        &mut self,
        qc: &QuorumCertificate,
    ) -> Result<Vec<PreparedVertex>, VertexStoreError> {
        if qc.epoch() != self.epoch() {
            return Err(VertexStoreError::WrongEpoch {
                expected: self.epoch(),
                actual: qc.epoch(),
            });
        }
        if qc.view() <= self.root().view() {
            return Ok(Vec::new());
        }
        let hash = qc.vertex_hash();
        let certified = self
            .vertices
            .get(&hash)
            .ok_or(VertexStoreError::UnknownVertex(hash))?;
        if !Self::certifies(qc, certified) {
            return Err(VertexStoreError::QcMismatch(hash));
        }

        if qc.view() > self.highest_qc.view() {
            debug!(view = qc.view().0, vertex = %hash, "New highest QC");
            self.highest_qc = qc.clone();
        }

        let Some(committed) = qc.committed() else {
            return Ok(Vec::new());
        };
        if committed.view <= self.root().view() {
            return Ok(Vec::new());
        }
        let committed_hash = committed.vertex_hash;
        let path = self
            .path_from_root(&committed_hash)
            .ok_or(VertexStoreError::UnknownVertex(committed_hash))?;

        self.ledger
            .commit(&path, qc)
            .map_err(VertexStoreError::CommitFailed)?;
        self.reroot(committed_hash);
        self.highest_committed_qc = qc.clone();

        debug!(
            committed = path.len(),
            root_view = self.root().view().0,
            root = %committed_hash,
            "Committed vertices"
        );
        Ok(path)
    }

    /// Vote data for voting on `header` whose vertex is in the store.
    pub fn vote_data_for(&self, header: &BftHeader) -> Option<VoteData> {
        let vertex = self.vertices.get(&header.vertex_hash)?;
        Some(VoteData::new(
            header.clone(),
            vertex.vertex.parent_qc.proposed().clone(),
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════════

    /// Whether `qc` is a consistent certificate for `vertex`.
    fn certifies(qc: &QuorumCertificate, vertex: &PreparedVertex) -> bool {
        let header = vertex.header();
        if qc.proposed() != &header {
            return false;
        }
        if vertex.vertex.is_genesis() {
            // The epoch's genesis QC.
            return qc.vote_data == QuorumCertificate::genesis(header).vote_data;
        }
        qc.vote_data == VoteData::new(header, vertex.vertex.parent_qc.proposed().clone())
    }

    /// Make `new_root` the root, retaining the committed path and dropping
    /// every branch that does not descend from it.
    fn reroot(&mut self, new_root: Hash) {
        // Committed path, old root included, moves to the retained set.
        let mut committed = Vec::new();
        let mut cursor = new_root;
        loop {
            committed.push(cursor);
            if cursor == self.root.hash {
                break;
            }
            match self.vertices.get(&cursor) {
                Some(v) => cursor = v.vertex.parent_hash(),
                None => break,
            }
        }

        // Everything reachable from the new root survives.
        let mut keep = HashMap::new();
        let mut queue = VecDeque::from([new_root]);
        while let Some(hash) = queue.pop_front() {
            if let Some(vertex) = self.vertices.remove(&hash) {
                keep.insert(hash, vertex);
            }
            if let Some(children) = self.children.get(&hash) {
                queue.extend(children.iter().copied());
            }
        }

        let old = std::mem::replace(&mut self.vertices, keep);
        let pruned = old.len();
        for hash in committed.into_iter().rev() {
            if hash == new_root {
                continue;
            }
            if let Some(vertex) = old.get(&hash) {
                self.retained_order.push_back((vertex.view(), hash));
                self.retained.insert(hash, vertex.clone());
            }
        }
        self.children.retain(|parent, _| self.vertices.contains_key(parent));
        if let Some(root) = self.vertices.get(&new_root) {
            self.root = root.clone();
        }

        let root_view = self.root().view();
        while let Some((view, hash)) = self.retained_order.front().copied() {
            if view.0 + self.retention_views >= root_view.0 {
                break;
            }
            self.retained_order.pop_front();
            self.retained.remove(&hash);
        }

        trace!(
            pruned = pruned,
            remaining = self.vertices.len(),
            retained = self.retained.len(),
            "Re-rooted vertex store"
        );
    }
}
