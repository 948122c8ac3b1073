//! BFT consensus state machine.
//!
//! [`BftState`] bundles everything a replica runs for one epoch: the vertex
//! store, pending votes, pacemaker, safety rules, proposer election and
//! vertex sync. It is a synchronous reducer: each call consumes one event and
//! returns the actions the runner must perform.

use concord_core::{
    Action, CommandSource, ConsensusMessage, Event, LedgerExecutor, SafetyStateStore,
    SubStateMachine,
};
use concord_types::{
    BftHeader, EpochId, Hash, HighQc, KeyPair, LedgerHeader, PreparedVertex, Proposal,
    QuorumCertificate, SafetyState, TimeoutCertificate, ValidatorId, ValidatorSet, Vertex, View,
    Vote,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{BftConfig, ConfigError};
use crate::pacemaker::{AdvanceReason, Pacemaker};
use crate::pending_votes::{PendingVotes, PendingVotesError, VoteOutcome};
use crate::proposer_election::ProposerElection;
use crate::safety_rules::{SafetyError, SafetyRules};
use crate::sync::{MissingVertex, VertexSync};
use crate::vertex_store::{VertexStore, VertexStoreError};

/// BFT statistics for monitoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BftStats {
    /// Current epoch.
    pub epoch: u64,
    /// Current view within the epoch.
    pub current_view: u64,
    pub proposals_made: u64,
    pub votes_sent: u64,
    /// Timeout votes broadcast.
    pub timeouts_sent: u64,
    /// Views this replica first left through a QC.
    pub vote_quorums: u64,
    /// Views this replica first left through a TC.
    pub timeout_quorums: u64,
    pub committed_vertices: u64,
    /// Inserted vertices whose parent is not from the previous view.
    pub indirect_parents: u64,
    /// Committed vertices whose parent is not from the previous view.
    pub indirect_parent_commits: u64,
    /// Votes SafetyRules refused to sign.
    pub safety_refusals: u64,
    /// Messages dropped for bad signatures, certificates or leaders.
    pub invalid_messages: u64,
    pub sync_requests: u64,
    /// Deferred events dropped because the queue was full.
    pub deferred_dropped: u64,
}

/// What a replica keeps across epochs.
#[derive(Clone)]
pub struct ReplicaContext {
    pub self_id: ValidatorId,
    pub key: KeyPair,
    pub ledger: Arc<dyn LedgerExecutor>,
    pub commands: Arc<dyn CommandSource>,
    pub safety_store: Arc<dyn SafetyStateStore>,
    pub config: BftConfig,
}

impl std::fmt::Debug for ReplicaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaContext")
            .field("self_id", &self.self_id)
            .field("config", &self.config)
            .finish()
    }
}

/// BFT consensus state for one epoch.
///
/// # State Machine Flow
///
/// 1. **Start** → arm the view timer, propose if leading view 1
/// 2. **Proposal** → apply its certificates, insert the vertex, vote to the
///    next leader
/// 3. **Vote** → collect, form a QC, advance and propose
/// 4. **Local timeout** → broadcast a timeout vote, form a TC from peers'
/// 5. **ViewUpdate** → apply the sender's certificates
/// 6. **Sync request/response** → serve or insert missing ancestors
pub struct BftState {
    // ═══════════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════════
    self_id: ValidatorId,
    epoch: EpochId,
    validators: ValidatorSet,
    /// Whether this replica votes and proposes in the epoch.
    is_member: bool,

    // ═══════════════════════════════════════════════════════════════════════════
    // Components
    // ═══════════════════════════════════════════════════════════════════════════
    store: VertexStore,
    pending_votes: PendingVotes,
    pacemaker: Pacemaker,
    safety: SafetyRules,
    election: ProposerElection,
    sync: VertexSync,
    commands: Arc<dyn CommandSource>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Buffers
    // ═══════════════════════════════════════════════════════════════════════════
    /// Valid proposals for views this replica has not reached yet.
    future_proposals: BTreeMap<View, (ValidatorId, Proposal)>,
    last_proposed_view: View,

    config: BftConfig,
    now: Duration,
    stats: BftStats,
}

impl std::fmt::Debug for BftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BftState")
            .field("self_id", &self.self_id)
            .field("epoch", &self.epoch)
            .field("view", &self.pacemaker.current_view())
            .field("store", &self.store)
            .field("pending_votes", &self.pending_votes.len())
            .field("future_proposals", &self.future_proposals.len())
            .finish()
    }
}

impl BftState {
    /// Create the state for the epoch that starts at `genesis_ledger`.
    ///
    /// A recovered or carried-over `safety_state` is rebased onto the epoch's
    /// genesis QC if it belongs to an earlier epoch. `stats` carries counters
    /// over from the previous epoch.
    pub fn new(
        ctx: &ReplicaContext,
        genesis_ledger: LedgerHeader,
        validators: ValidatorSet,
        safety_state: Option<SafetyState>,
        stats: BftStats,
    ) -> Result<Self, ConfigError> {
        let epoch = genesis_ledger.epoch;
        let pacemaker = Pacemaker::new(epoch, &ctx.config)?;
        let genesis = PreparedVertex::new(Vertex::genesis(&genesis_ledger), genesis_ledger);
        let genesis_qc = QuorumCertificate::genesis(genesis.header());
        let safety_state = match safety_state {
            Some(state) => state.rebase(epoch, genesis_qc.clone()),
            None => SafetyState::new(epoch, genesis_qc.clone()),
        };

        let store = VertexStore::new(
            genesis,
            genesis_qc.clone(),
            ctx.ledger.clone(),
            ctx.config.committed_retention_views,
        );
        let safety = SafetyRules::new(
            ctx.self_id,
            ctx.key.clone(),
            safety_state,
            ctx.safety_store.clone(),
            genesis_qc,
        );

        Ok(Self {
            self_id: ctx.self_id,
            epoch,
            is_member: validators.contains(ctx.self_id),
            election: ProposerElection::new(&validators),
            validators,
            store,
            pending_votes: PendingVotes::new(),
            pacemaker,
            safety,
            sync: VertexSync::new(
                epoch,
                ctx.self_id,
                ctx.config.sync_request_timeout,
                ctx.config.max_deferred_events,
            ),
            commands: ctx.commands.clone(),
            future_proposals: BTreeMap::new(),
            last_proposed_view: View::GENESIS,
            config: ctx.config.clone(),
            now: Duration::ZERO,
            stats,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn is_member(&self) -> bool {
        self.is_member
    }

    pub fn current_view(&self) -> View {
        self.pacemaker.current_view()
    }

    pub fn store(&self) -> &VertexStore {
        &self.store
    }

    pub fn pacemaker(&self) -> &Pacemaker {
        &self.pacemaker
    }

    pub fn safety_state(&self) -> &SafetyState {
        self.safety.state()
    }

    pub fn leader(&self, view: View) -> ValidatorId {
        self.election.proposer(view)
    }

    pub fn stats(&self) -> BftStats {
        BftStats {
            epoch: self.epoch.0,
            current_view: self.pacemaker.current_view().0,
            ..self.stats
        }
    }

    fn timestamp_ms(&self) -> u64 {
        u64::try_from(self.now.as_millis()).unwrap_or(u64::MAX)
    }

    fn to_self(&self, message: ConsensusMessage) -> Action {
        Action::EnqueueInternal {
            event: Event::MessageReceived {
                sender: self.self_id,
                message,
            },
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Enter the first view of the epoch.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = self.pacemaker.start();
        if actions.is_empty() {
            return actions;
        }
        info!(
            validator = %self.self_id,
            epoch = self.epoch.0,
            member = self.is_member,
            validators = self.validators.len(),
            "Starting epoch"
        );
        actions.extend(self.on_view_entered());
        actions
    }

    /// Cancel every outstanding timer, used when the epoch is retired.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = self.pacemaker.stop();
        actions.extend(self.sync.stop());
        actions
    }

    /// Work to do on arriving in the pacemaker's current view.
    fn on_view_entered(&mut self) -> Vec<Action> {
        let view = self.pacemaker.current_view();
        let mut actions = vec![];
        self.pending_votes
            .prune_below(self.pacemaker.last_quorum_view().next());

        let leader = self.election.proposer(view);
        if self.is_member && leader != self.self_id {
            actions.push(Action::Send {
                to: leader,
                message: ConsensusMessage::ViewUpdate {
                    epoch: self.epoch,
                    view,
                    high_qc: self.store.high_qc(),
                },
            });
        }

        self.future_proposals = self.future_proposals.split_off(&view);
        if let Some((sender, proposal)) = self.future_proposals.remove(&view) {
            actions.push(Action::EnqueueInternal {
                event: Event::MessageReceived {
                    sender,
                    message: ConsensusMessage::Proposal(proposal),
                },
            });
        }

        if self.is_member && leader == self.self_id {
            actions.extend(self.propose(view));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════════════

    /// Build, sign and broadcast a proposal for `view` on the highest QC.
    fn propose(&mut self, view: View) -> Vec<Action> {
        if view <= self.last_proposed_view {
            return vec![];
        }
        self.last_proposed_view = view;

        let parent_qc = self.store.highest_qc().clone();
        let commands = if parent_qc.ledger_header().is_end_of_epoch() {
            vec![]
        } else {
            let uncommitted = self
                .store
                .path_from_root(&parent_qc.vertex_hash())
                .unwrap_or_default();
            self.commands.next_commands(view, &uncommitted)
        };

        let mut high_qc = self.store.high_qc();
        if high_qc
            .highest_tc
            .as_ref()
            .is_some_and(|tc| tc.view < parent_qc.view())
        {
            high_qc.highest_tc = None;
        }

        let vertex = Vertex::new_proposal(parent_qc, view, self.self_id, commands);
        debug!(
            validator = %self.self_id,
            view = view.0,
            vertex = %vertex.hash(),
            parent_view = vertex.parent_view().0,
            commands = vertex.commands.len(),
            "Proposing"
        );
        let proposal = self.safety.sign_proposal(vertex, high_qc);
        self.stats.proposals_made += 1;
        vec![
            Action::Broadcast {
                message: ConsensusMessage::Proposal(proposal.clone()),
            },
            self.to_self(ConsensusMessage::Proposal(proposal)),
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Message handlers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Dispatch a message already known to be for this epoch.
    pub fn on_message(&mut self, sender: ValidatorId, message: ConsensusMessage) -> Vec<Action> {
        match message {
            ConsensusMessage::Proposal(proposal) => self.on_proposal(sender, proposal),
            ConsensusMessage::Vote(vote) => self.on_vote(sender, vote, false),
            ConsensusMessage::Timeout(vote) => self.on_vote(sender, vote, true),
            ConsensusMessage::ViewUpdate { view, high_qc, .. } => {
                self.on_view_update(sender, view, high_qc)
            }
            ConsensusMessage::SyncRequest {
                vertex_hash, count, ..
            } => self.on_sync_request(sender, vertex_hash, count),
            ConsensusMessage::SyncResponse { vertices, .. } => {
                self.on_sync_response(sender, vertices)
            }
        }
    }

    #[instrument(skip(self, proposal), fields(
        validator = %self.self_id,
        view = proposal.view().0,
        proposer = ?proposal.author()
    ))]
    fn on_proposal(&mut self, sender: ValidatorId, proposal: Proposal) -> Vec<Action> {
        let view = proposal.view();
        let current = self.pacemaker.current_view();
        if view < current {
            trace!(current = current.0, "Ignoring proposal for past view");
            return vec![];
        }
        if let Err(reason) = self.check_proposal(&proposal) {
            debug!(sender = %sender, reason, "Dropping invalid proposal");
            self.stats.invalid_messages += 1;
            return vec![];
        }

        let mut actions = vec![];
        let high_qc = &proposal.high_qc;
        let qcs = [
            &high_qc.highest_committed_qc,
            &proposal.vertex.parent_qc,
            &high_qc.highest_qc,
        ];
        let applied = self.process_certificates(
            &qcs,
            high_qc.highest_tc.as_ref(),
            AdvanceReason::Qc,
            sender,
            &mut actions,
        );
        if let Err(missing) = applied {
            self.defer(missing, sender, ConsensusMessage::Proposal(proposal));
            return actions;
        }

        let current = self.pacemaker.current_view();
        if view > current {
            self.buffer_proposal(sender, proposal);
            return actions;
        }
        if view < current {
            trace!(current = current.0, "Proposal overtaken by its own certificates");
            return actions;
        }

        let vertex = proposal.vertex;
        match self.insert_vertex(vertex.clone()) {
            Ok(header) => actions.extend(self.vote_on(&vertex, header)),
            Err(e) => {
                debug!(error = %e, "Proposal vertex not inserted");
                self.stats.invalid_messages += 1;
            }
        }
        actions
    }

    /// Signature, leader and certificate checks for a proposal.
    fn check_proposal(&mut self, proposal: &Proposal) -> Result<(), &'static str> {
        let vertex = &proposal.vertex;
        if vertex.is_timeout || vertex.is_genesis() {
            return Err("not a proposal vertex");
        }
        let author = proposal.author().ok_or("no proposer")?;
        if author != self.election.proposer(vertex.view) {
            return Err("proposer is not the view leader");
        }
        let key = self
            .validators
            .public_key(author)
            .ok_or("unknown proposer")?;
        if !proposal.verify(key) {
            return Err("bad proposal signature");
        }
        if vertex.parent_view() >= vertex.view {
            return Err("parent not older than vertex");
        }
        self.safety
            .verify_qc(&vertex.parent_qc, &self.validators)
            .map_err(|_| "bad parent QC")?;
        self.safety
            .verify_high_qc(&proposal.high_qc, &self.validators)
            .map_err(|_| "bad high QC")?;
        Ok(())
    }

    fn buffer_proposal(&mut self, sender: ValidatorId, proposal: Proposal) {
        let view = proposal.view();
        if !self.future_proposals.contains_key(&view)
            && self.future_proposals.len() >= self.config.max_future_proposals
        {
            match self.future_proposals.last_key_value() {
                Some((&furthest, _)) if furthest > view => {
                    self.future_proposals.remove(&furthest);
                }
                _ => {
                    trace!(view = view.0, "Future proposal buffer full");
                    return;
                }
            }
        }
        trace!(view = view.0, "Buffering proposal for future view");
        self.future_proposals.insert(view, (sender, proposal));
    }

    /// Vote for a freshly inserted vertex and route the vote to the next
    /// view's leader.
    fn vote_on(&mut self, vertex: &Vertex, header: BftHeader) -> Vec<Action> {
        if !self.is_member {
            return vec![];
        }
        let timestamp_ms = self.timestamp_ms();
        let high_qc = self.store.high_qc();
        match self.safety.vote_for(vertex, header, timestamp_ms, high_qc) {
            Ok(vote) => {
                self.pacemaker.on_voted(vertex.view);
                self.stats.votes_sent += 1;
                let next_leader = self.election.proposer(vertex.view.next());
                trace!(view = vertex.view.0, next_leader = %next_leader, "Sending vote");
                let message = ConsensusMessage::Vote(vote);
                if next_leader == self.self_id {
                    vec![self.to_self(message)]
                } else {
                    vec![Action::Send {
                        to: next_leader,
                        message,
                    }]
                }
            }
            Err(e) => self.on_safety_error(e),
        }
    }

    fn on_safety_error(&mut self, e: SafetyError) -> Vec<Action> {
        if e.is_fatal() {
            error!(validator = %self.self_id, error = %e, "Halting replica");
            return vec![Action::Halt {
                reason: e.to_string(),
            }];
        }
        warn!(validator = %self.self_id, error = %e, "Safety rules refused to sign");
        self.stats.safety_refusals += 1;
        vec![]
    }

    #[instrument(skip(self, vote), fields(
        validator = %self.self_id,
        view = vote.view().0,
        author = %vote.author,
        timeout = vote.is_timeout()
    ))]
    fn on_vote(&mut self, sender: ValidatorId, vote: Vote, as_timeout: bool) -> Vec<Action> {
        let view = vote.view();
        if !self.pacemaker.accepts_votes_for(view) {
            trace!("Ignoring vote for certified view");
            return vec![];
        }
        if vote.is_timeout() != as_timeout {
            debug!("Vote kind does not match message");
            self.stats.invalid_messages += 1;
            return vec![];
        }
        if vote.author != sender {
            debug!(sender = %sender, "Vote not sent by its author");
            self.stats.invalid_messages += 1;
            return vec![];
        }
        // Our own votes arrive through the internal queue, already signed.
        if sender != self.self_id {
            let Some(key) = self.validators.public_key(vote.author) else {
                debug!("Vote from unknown validator");
                self.stats.invalid_messages += 1;
                return vec![];
            };
            if !vote.verify(key) {
                debug!("Bad vote signature");
                self.stats.invalid_messages += 1;
                return vec![];
            }
        }
        if let Err(e) = self.safety.verify_high_qc(&vote.high_qc, &self.validators) {
            debug!(error = %e, "Bad certificate in vote");
            self.stats.invalid_messages += 1;
            return vec![];
        }

        let mut actions = vec![];
        let qcs = [&vote.high_qc.highest_committed_qc, &vote.high_qc.highest_qc];
        let applied = self.process_certificates(
            &qcs,
            vote.high_qc.highest_tc.as_ref(),
            AdvanceReason::ViewUpdate,
            sender,
            &mut actions,
        );
        if let Err(missing) = applied {
            let message = if as_timeout {
                ConsensusMessage::Timeout(vote)
            } else {
                ConsensusMessage::Vote(vote)
            };
            self.defer(missing, sender, message);
            return actions;
        }
        if !self.pacemaker.accepts_votes_for(view) {
            return actions;
        }

        match self.pending_votes.insert_vote(&vote, &self.validators) {
            Ok(VoteOutcome::NoQuorumYet) => {}
            Ok(VoteOutcome::FormedQc(qc)) => {
                debug!(view = qc.view().0, vertex = %qc.vertex_hash(), "Formed QC");
                self.on_qc_formed(qc, sender, &mut actions);
            }
            Ok(VoteOutcome::FormedTc(tc)) => {
                debug!(view = tc.view.0, signers = tc.signatures.len(), "Formed TC");
                self.apply_tc(&tc, &mut actions);
            }
            Err(PendingVotesError::DuplicateAuthor { .. }) => {
                trace!("Duplicate vote");
            }
            Err(e) => {
                debug!(error = %e, "Vote rejected");
                self.stats.invalid_messages += 1;
            }
        }
        actions
    }

    fn on_qc_formed(&mut self, qc: QuorumCertificate, sender: ValidatorId, actions: &mut Vec<Action>) {
        let applied =
            self.process_certificates(&[&qc], None, AdvanceReason::Qc, sender, actions);
        if let Err(missing) = applied {
            // Replayed as a view update from ourselves once the vertex arrives.
            let high_qc = HighQc {
                highest_committed_qc: self.store.highest_committed_qc().clone(),
                highest_qc: qc,
                highest_tc: None,
            };
            let message = ConsensusMessage::ViewUpdate {
                epoch: self.epoch,
                view: high_qc.highest_view(),
                high_qc,
            };
            self.defer(missing, self.self_id, message);
        }
    }

    #[instrument(skip(self, high_qc), fields(validator = %self.self_id, view = view.0))]
    fn on_view_update(&mut self, sender: ValidatorId, view: View, high_qc: HighQc) -> Vec<Action> {
        if let Err(e) = self.safety.verify_high_qc(&high_qc, &self.validators) {
            debug!(sender = %sender, error = %e, "Bad certificate in view update");
            self.stats.invalid_messages += 1;
            return vec![];
        }
        let mut actions = vec![];
        let qcs = [&high_qc.highest_committed_qc, &high_qc.highest_qc];
        let applied = self.process_certificates(
            &qcs,
            high_qc.highest_tc.as_ref(),
            AdvanceReason::ViewUpdate,
            sender,
            &mut actions,
        );
        if let Err(missing) = applied {
            let message = ConsensusMessage::ViewUpdate {
                epoch: self.epoch,
                view,
                high_qc,
            };
            self.defer(missing, sender, message);
        }
        actions
    }

    fn on_sync_request(&mut self, sender: ValidatorId, vertex_hash: Hash, count: usize) -> Vec<Action> {
        let count = count.min(self.config.max_sync_batch);
        let vertices = self.store.get_vertices(&vertex_hash, count);
        if vertices.is_empty() {
            trace!(vertex = %vertex_hash, sender = %sender, "Cannot serve sync request");
            return vec![];
        }
        trace!(
            vertex = %vertex_hash,
            sender = %sender,
            served = vertices.len(),
            "Serving sync request"
        );
        vec![Action::Send {
            to: sender,
            message: ConsensusMessage::SyncResponse {
                epoch: self.epoch,
                vertices,
            },
        }]
    }

    /// Insert fetched vertices, oldest first, applying each parent QC.
    fn on_sync_response(&mut self, sender: ValidatorId, vertices: Vec<Vertex>) -> Vec<Action> {
        let mut actions = vec![];
        for vertex in vertices.into_iter().rev() {
            if vertex.epoch != self.epoch || vertex.is_genesis() {
                self.stats.invalid_messages += 1;
                break;
            }
            if self.store.contains(&vertex.hash()) {
                continue;
            }
            if let Err(e) = self.safety.verify_qc(&vertex.parent_qc, &self.validators) {
                debug!(sender = %sender, error = %e, "Bad parent QC in sync response");
                self.stats.invalid_messages += 1;
                break;
            }
            if let Some(hash) = self.store.sync_needed(&vertex.parent_qc) {
                let missing = MissingVertex {
                    hash,
                    view: vertex.parent_view(),
                };
                let signers: Vec<ValidatorId> =
                    vertex.parent_qc.signatures.signers().copied().collect();
                actions.extend(self.request_sync(missing, sender, signers));
                break;
            }
            if !self.apply_qc(&vertex.parent_qc, AdvanceReason::Qc, &mut actions) {
                break;
            }
            if let Err(e) = self.insert_vertex(vertex) {
                debug!(sender = %sender, error = %e, "Synced vertex not inserted");
                break;
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════════

    /// The view timer fired: broadcast a timeout vote for the view.
    ///
    /// A replica that already voted re-signs that vote as a timeout; one that
    /// did not votes for an empty timeout vertex on its highest QC.
    pub fn on_local_timeout(&mut self, view: View) -> Vec<Action> {
        let Some(mut actions) = self.pacemaker.on_local_timeout(self.epoch, view) else {
            return vec![];
        };
        if !self.is_member {
            return actions;
        }

        let vote = match self.safety.last_vote(view) {
            Some(vote) => vote,
            None => {
                let leader = self.election.proposer(view);
                let vertex = Vertex::new_timeout(self.store.highest_qc().clone(), view, leader);
                let header = match self.insert_vertex(vertex.clone()) {
                    Ok(header) => header,
                    Err(e) => {
                        warn!(view = view.0, error = %e, "Timeout vertex not inserted");
                        return actions;
                    }
                };
                let timestamp_ms = self.timestamp_ms();
                let high_qc = self.store.high_qc();
                match self.safety.vote_for(&vertex, header, timestamp_ms, high_qc) {
                    Ok(vote) => vote,
                    Err(e) => {
                        actions.extend(self.on_safety_error(e));
                        return actions;
                    }
                }
            }
        };

        let resend = vote.is_timeout();
        match self.safety.timeout_vote(vote) {
            Ok(timeout) => {
                self.stats.timeouts_sent += 1;
                actions.push(Action::Broadcast {
                    message: ConsensusMessage::Timeout(timeout.clone()),
                });
                if !resend {
                    actions.push(self.to_self(ConsensusMessage::Timeout(timeout)));
                }
            }
            Err(e) => actions.extend(self.on_safety_error(e)),
        }
        actions
    }

    pub fn on_sync_timeout(&mut self, vertex_hash: Hash) -> Vec<Action> {
        if self.store.contains(&vertex_hash) {
            return vec![];
        }
        self.sync.on_timeout(vertex_hash)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Certificates
    // ═══════════════════════════════════════════════════════════════════════════

    /// Apply verified certificates: QCs in the given order, then the TC.
    ///
    /// If any QC names a vertex this replica lacks, a sync request for the
    /// highest such vertex is issued to `sender` and that vertex is returned;
    /// nothing is applied in that case.
    fn process_certificates(
        &mut self,
        qcs: &[&QuorumCertificate],
        tc: Option<&TimeoutCertificate>,
        reason: AdvanceReason,
        sender: ValidatorId,
        actions: &mut Vec<Action>,
    ) -> Result<(), MissingVertex> {
        let missing = qcs
            .iter()
            .filter_map(|qc| {
                let hash = self.store.sync_needed(qc)?;
                Some((MissingVertex { hash, view: qc.view() }, *qc))
            })
            .max_by_key(|(missing, _)| missing.view);
        if let Some((missing, qc)) = missing {
            let signers: Vec<ValidatorId> = qc.signatures.signers().copied().collect();
            actions.extend(self.request_sync(missing, sender, signers));
            return Err(missing);
        }

        for qc in qcs {
            if !self.apply_qc(qc, reason, actions) {
                return Ok(());
            }
        }
        if let Some(tc) = tc {
            self.apply_tc(tc, actions);
        }
        Ok(())
    }

    /// Apply a verified TC. A TC names no vertex, so nothing is fetched.
    fn apply_tc(&mut self, tc: &TimeoutCertificate, actions: &mut Vec<Action>) {
        self.store.insert_tc(tc.clone());
        self.note_certificate(tc.view, AdvanceReason::Tc, actions);
    }

    /// Apply one QC whose vertex is present. Returns false if it was
    /// rejected or the ledger failed.
    fn apply_qc(
        &mut self,
        qc: &QuorumCertificate,
        reason: AdvanceReason,
        actions: &mut Vec<Action>,
    ) -> bool {
        match self.store.insert_qc(qc) {
            Ok(committed) => {
                if !committed.is_empty() {
                    self.record_commits(&committed);
                    actions.push(Action::EmitCommitted {
                        vertices: committed,
                        proof: qc.clone(),
                    });
                }
            }
            Err(VertexStoreError::CommitFailed(e)) => {
                error!(validator = %self.self_id, error = %e, "Ledger commit failed");
                actions.push(Action::Halt {
                    reason: format!("ledger commit failed: {e}"),
                });
                return false;
            }
            Err(e) => {
                debug!(view = qc.view().0, error = %e, "QC not applied");
                self.stats.invalid_messages += 1;
                return false;
            }
        }
        self.note_certificate(qc.view(), reason, actions);
        true
    }

    /// Count a first certificate for `view` and advance the pacemaker.
    fn note_certificate(&mut self, view: View, reason: AdvanceReason, actions: &mut Vec<Action>) {
        if view > self.pacemaker.last_quorum_view() {
            match reason {
                AdvanceReason::Tc => self.stats.timeout_quorums += 1,
                AdvanceReason::Qc | AdvanceReason::ViewUpdate => self.stats.vote_quorums += 1,
            }
        }
        if let Some(timers) = self.pacemaker.process_certificate(view, reason) {
            actions.extend(timers);
            actions.extend(self.on_view_entered());
        }
    }

    fn record_commits(&mut self, committed: &[PreparedVertex]) {
        for prepared in committed {
            let vertex = &prepared.vertex;
            self.stats.committed_vertices += 1;
            if vertex.view != vertex.parent_view().next() {
                self.stats.indirect_parent_commits += 1;
            }
        }
        if let Some(last) = committed.last() {
            info!(
                validator = %self.self_id,
                epoch = self.epoch.0,
                view = last.view().0,
                count = committed.len(),
                state_version = last.ledger.state_version,
                "Committed"
            );
        }
    }

    fn insert_vertex(&mut self, vertex: Vertex) -> Result<BftHeader, VertexStoreError> {
        let fresh = !self.store.contains(&vertex.hash());
        let indirect = vertex.view != vertex.parent_view().next();
        let header = self.store.insert(vertex)?;
        if fresh && indirect {
            self.stats.indirect_parents += 1;
        }
        Ok(header)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════════

    fn request_sync(
        &mut self,
        missing: MissingVertex,
        sender: ValidatorId,
        signers: Vec<ValidatorId>,
    ) -> Vec<Action> {
        let actions = self
            .sync
            .request(missing, sender, signers, self.config.max_sync_batch);
        if !actions.is_empty() {
            self.stats.sync_requests += 1;
        }
        actions
    }

    fn defer(&mut self, missing: MissingVertex, sender: ValidatorId, message: ConsensusMessage) {
        trace!(
            vertex = %missing.hash,
            message = message.type_name(),
            "Deferring until vertex arrives"
        );
        let event = Event::MessageReceived { sender, message };
        if self.sync.defer(missing, event) {
            self.stats.deferred_dropped += 1;
        }
    }
}

impl SubStateMachine for BftState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        let mut actions = match event {
            Event::Start => self.start(),
            Event::LocalTimeout { epoch, view } if *epoch == self.epoch => {
                self.on_local_timeout(*view)
            }
            Event::SyncTimeout { epoch, vertex_hash } if *epoch == self.epoch => {
                self.on_sync_timeout(*vertex_hash)
            }
            Event::MessageReceived { sender, message } if message.epoch() == self.epoch => {
                self.on_message(*sender, message.clone())
            }
            _ => return None,
        };
        // Certificates at or below the root no longer need their vertex.
        let store = &self.store;
        let root_view = store.root().view();
        actions.extend(
            self.sync
                .resolve(|missing| missing.view <= root_view || store.contains(&missing.hash)),
        );
        Some(actions)
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}
