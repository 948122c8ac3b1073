//! Deterministic simulation runner.
//!
//! All nodes share one event queue ordered by `(time, priority, node,
//! sequence)`. The caller drives it explicitly with [`SimulationRunner::next_event`]
//! and [`SimulationRunner::step`], or lets [`SimulationRunner::run_until`]
//! loop over both.

use crate::event_queue::EventKey;
use crate::network::{Delivery, MessageInfo, NetworkConfig, SimulatedNetwork};
use crate::storage::{SimCommandSource, SimLedger, SimSafetyStore};
use crate::NodeIndex;
use concord_bft::BftConfig;
use concord_core::{Action, ConsensusMessage, Event, StateMachine, TimerId};
use concord_node::{NodeBuilder, NodeConfig, NodeError, NodeStateMachine};
use concord_types::test_utils::{genesis_ledger, validator_set};
use concord_types::{EpochId, Hash, KeyPair, ValidatorId, ValidatorSet, View};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Voting power of each validator; node `i` is `ValidatorId(i)`.
    pub weights: Vec<u64>,
    /// Views per epoch. Zero keeps everyone in epoch 0.
    pub epoch_length: u64,
    /// Commands per proposal.
    pub commands_per_vertex: usize,
    pub bft: BftConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            weights: vec![1; 4],
            epoch_length: 0,
            commands_per_vertex: 1,
            bft: BftConfig::default(),
        }
    }
}

/// A vertex a node reported as committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedVertex {
    pub epoch: EpochId,
    pub view: View,
    pub hash: Hash,
    pub state_version: u64,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 3],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages sent (successfully scheduled for delivery).
    pub messages_sent: u64,
    /// Messages dropped due to network partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Messages dropped by a mutator.
    pub messages_dropped_mutator: u64,
    /// Messages a mutator held back.
    pub messages_delayed: u64,
    /// Events addressed to a crashed node.
    pub events_dropped_crashed: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
    /// Commit notifications across all nodes.
    pub commits_emitted: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss + mutators).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss + self.messages_dropped_mutator
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
///
/// Each node has its own ledger and safety store. Nodes can be crashed and
/// restarted; a restarted node is rebuilt from its persisted safety state.
pub struct SimulationRunner {
    config: SimulationConfig,
    validators: ValidatorSet,
    keys: Vec<KeyPair>,

    /// All nodes, indexed by NodeIndex. `None` while crashed.
    nodes: Vec<Option<NodeStateMachine>>,
    ledgers: Vec<Arc<SimLedger>>,
    safety_stores: Vec<Arc<SimSafetyStore>>,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    /// Current simulation time.
    now: Duration,

    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Maps (node, timer_id) -> event_key for replacement and cancellation.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    stats: SimulationStats,

    /// Committed vertices per node, in commit order.
    committed: Vec<Vec<CommittedVertex>>,

    /// Epochs each node switched to.
    epoch_changes: Vec<Vec<EpochId>>,

    /// Halt reason per node, kept across restarts.
    halts: Vec<Option<String>>,
}

impl std::fmt::Debug for SimulationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("nodes", &self.nodes.len())
            .field("now", &self.now)
            .field("queued", &self.event_queue.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SimulationRunner {
    /// Create a runner with one node per configured weight.
    ///
    /// `network_config.num_validators` is overridden by the number of
    /// weights.
    pub fn new(
        config: SimulationConfig,
        mut network_config: NetworkConfig,
        seed: u64,
    ) -> Result<Self, NodeError> {
        let (validators, keys) = validator_set(&config.weights);
        let num_nodes = keys.len();
        network_config.num_validators = num_nodes as u32;

        let ledgers: Vec<Arc<SimLedger>> = (0..num_nodes)
            .map(|_| Arc::new(SimLedger::new(config.epoch_length, validators.clone())))
            .collect();
        let safety_stores: Vec<Arc<SimSafetyStore>> = (0..num_nodes)
            .map(|_| Arc::new(SimSafetyStore::new()))
            .collect();

        let mut runner = Self {
            config,
            validators,
            keys,
            nodes: Vec::with_capacity(num_nodes),
            ledgers,
            safety_stores,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimulatedNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            stats: SimulationStats::default(),
            committed: vec![vec![]; num_nodes],
            epoch_changes: vec![vec![]; num_nodes],
            halts: vec![None; num_nodes],
        };
        for index in 0..num_nodes {
            let node = runner.build_node(index as NodeIndex)?;
            runner.nodes.push(Some(node));
        }

        info!(
            num_nodes,
            total_voting_power = runner.validators.total_voting_power(),
            epoch_length = runner.config.epoch_length,
            seed,
            "Created simulation runner"
        );
        Ok(runner)
    }

    fn build_node(&self, index: NodeIndex) -> Result<NodeStateMachine, NodeError> {
        let i = index as usize;
        NodeBuilder::new()
            .config(NodeConfig {
                validator_id: ValidatorId(index as u64),
                genesis_ledger: genesis_ledger(EpochId::GENESIS),
                validators: self.validators.clone(),
                bft: self.config.bft.clone(),
            })
            .signing_key(self.keys[i].clone())
            .ledger(self.ledgers[i].clone())
            .commands(Arc::new(SimCommandSource::new(
                index,
                self.config.commands_per_vertex,
            )))
            .safety_store(self.safety_stores[i].clone())
            .build()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// A node, or `None` if it is crashed or out of range.
    pub fn node(&self, index: NodeIndex) -> Option<&NodeStateMachine> {
        self.nodes.get(index as usize)?.as_ref()
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    /// Mutable access for partitions, loss and mutators.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    pub fn ledger(&self, index: NodeIndex) -> Option<&SimLedger> {
        self.ledgers.get(index as usize).map(|l| l.as_ref())
    }

    pub fn safety_store(&self, index: NodeIndex) -> Option<&SimSafetyStore> {
        self.safety_stores.get(index as usize).map(|s| s.as_ref())
    }

    /// Vertices `index` committed, in order.
    pub fn committed(&self, index: NodeIndex) -> &[CommittedVertex] {
        self.committed
            .get(index as usize)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn epoch_changes(&self, index: NodeIndex) -> &[EpochId] {
        self.epoch_changes
            .get(index as usize)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn halt_reason(&self, index: NodeIndex) -> Option<&str> {
        self.halts.get(index as usize)?.as_deref()
    }

    /// Lowest `(epoch, view)` among running nodes.
    pub fn min_progress(&self) -> Option<(EpochId, View)> {
        self.nodes
            .iter()
            .flatten()
            .map(|n| (n.epoch(), n.epochs().bft().current_view()))
            .min()
    }

    /// First pair of nodes whose commit logs disagree, with the position.
    ///
    /// Logs of different lengths agree if one is a prefix of the other.
    pub fn find_fork(&self) -> Option<(NodeIndex, NodeIndex, usize)> {
        for a in 0..self.committed.len() {
            for b in a + 1..self.committed.len() {
                let diverged = self.committed[a]
                    .iter()
                    .zip(&self.committed[b])
                    .position(|(x, y)| x.hash != y.hash);
                if let Some(position) = diverged {
                    return Some((a as NodeIndex, b as NodeIndex, position));
                }
            }
        }
        None
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Driving
    // ═══════════════════════════════════════════════════════════════════════

    /// Schedule `Event::Start` for every running node.
    pub fn start_all(&mut self) {
        for index in 0..self.nodes.len() as NodeIndex {
            if self.node(index).is_some() {
                self.schedule_event(index, self.now, Event::Start);
            }
        }
    }

    /// Schedule an initial event (e.g., to start one node late).
    pub fn schedule_initial_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        let time = self.now + delay;
        self.schedule_event(node, time, event);
    }

    /// Remove and return the next event without processing it.
    pub fn next_event(&mut self) -> Option<(EventKey, Event)> {
        self.event_queue.pop_first()
    }

    /// Time of the next queued event.
    pub fn peek_time(&self) -> Option<Duration> {
        self.event_queue.first_key_value().map(|(key, _)| key.time)
    }

    /// Process one event popped by [`SimulationRunner::next_event`].
    pub fn step(&mut self, key: EventKey, event: Event) {
        self.now = self.now.max(key.time);
        let index = key.node_index;
        if let Event::LocalTimeout { epoch, view } = &event {
            self.timers.remove(&(
                index,
                TimerId::LocalTimeout {
                    epoch: *epoch,
                    view: *view,
                },
            ));
        }
        if let Event::SyncTimeout { epoch, vertex_hash } = &event {
            self.timers.remove(&(
                index,
                TimerId::SyncRetry {
                    epoch: *epoch,
                    vertex_hash: *vertex_hash,
                },
            ));
        }

        let now = self.now;
        let Some(node) = self.nodes.get_mut(index as usize).and_then(Option::as_mut) else {
            self.stats.events_dropped_crashed += 1;
            trace!(node = index, event = event.type_name(), "Dropping event for crashed node");
            return;
        };

        trace!(time = ?now, node = index, event = event.type_name(), "Processing event");
        self.stats.events_processed += 1;
        self.stats.events_by_priority[event.priority() as usize] += 1;

        node.set_time(now);
        let actions = node.handle(event);
        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(index, action);
        }
    }

    /// Run simulation until no more events or time limit reached.
    pub fn run_until(&mut self, end_time: Duration) {
        while self.peek_time().is_some_and(|t| t <= end_time) {
            if let Some((key, event)) = self.next_event() {
                self.step(key, event);
            }
        }
        self.now = self.now.max(end_time);
        trace!(
            events_processed = self.stats.events_processed,
            actions_generated = self.stats.actions_generated,
            final_time = ?self.now,
            "Simulation run complete"
        );
    }

    /// Run until `done` holds or `end_time` passes. Returns whether `done`
    /// was reached.
    pub fn run_until_condition(
        &mut self,
        end_time: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> bool {
        while !done(self) {
            match self.peek_time() {
                Some(t) if t <= end_time => {
                    if let Some((key, event)) = self.next_event() {
                        self.step(key, event);
                    }
                }
                _ => return false,
            }
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Faults
    // ═══════════════════════════════════════════════════════════════════════

    /// Stop a node. Its queued events and timers are discarded; its safety
    /// store is kept.
    pub fn crash(&mut self, index: NodeIndex) {
        let Some(slot) = self.nodes.get_mut(index as usize) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }
        self.event_queue.retain(|key, _| key.node_index != index);
        self.timers.retain(|(node, _), _| *node != index);
        info!(node = index, time = ?self.now, "Node crashed");
    }

    /// Rebuild a crashed node from its persisted safety state and start it.
    ///
    /// Its commit log restarts empty.
    pub fn restart(&mut self, index: NodeIndex) -> Result<(), NodeError> {
        if self.node(index).is_some() || index as usize >= self.nodes.len() {
            return Ok(());
        }
        let node = self.build_node(index)?;
        self.nodes[index as usize] = Some(node);
        // The node replays commits from genesis.
        self.committed[index as usize].clear();
        self.schedule_event(index, self.now, Event::Start);
        info!(node = index, time = ?self.now, "Node restarted");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Actions
    // ═══════════════════════════════════════════════════════════════════════

    /// Process an action from a node.
    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Send { to, message } => {
                self.try_deliver_message(from, to.0 as NodeIndex, message);
            }
            Action::Broadcast { message } => {
                for to in self.network.all_nodes() {
                    if to != from {
                        self.try_deliver_message(from, to, message.clone());
                    }
                }
            }
            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let event = timer_to_event(id);
                let key = self.schedule_event(from, self.now + duration, event);
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }
            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }
            Action::EnqueueInternal { event } => {
                self.sequence += 1;
                let key = EventKey::internal(self.now, from, self.sequence);
                self.event_queue.insert(key, event);
            }
            Action::EmitCommitted { vertices, .. } => {
                self.stats.commits_emitted += 1;
                let log = &mut self.committed[from as usize];
                log.extend(vertices.iter().map(|v| CommittedVertex {
                    epoch: v.vertex.epoch,
                    view: v.view(),
                    hash: v.hash,
                    state_version: v.ledger.state_version,
                }));
                debug!(node = from, count = vertices.len(), total = log.len(), "Vertices committed");
            }
            Action::EmitEpochChange { epoch, validators } => {
                info!(node = from, epoch = epoch.0, validators = validators.len(), "Epoch change");
                self.epoch_changes[from as usize].push(epoch);
            }
            Action::Halt { reason } => {
                warn!(node = from, reason = %reason, "Node halted");
                self.halts[from as usize] = Some(reason);
            }
        }
    }

    /// Schedule an event.
    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    /// Try to deliver a message, accounting for mutators, partitions and
    /// packet loss.
    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, mut message: ConsensusMessage) {
        if to as usize >= self.nodes.len() {
            trace!(from, to, "Message to unknown node");
            return;
        }

        let info = MessageInfo {
            from,
            to,
            now: self.now,
        };
        let extra = match self.network.mutate(&info, &mut message) {
            Delivery::Deliver => Duration::ZERO,
            Delivery::Delay(d) => {
                self.stats.messages_delayed += 1;
                d
            }
            Delivery::Drop => {
                self.stats.messages_dropped_mutator += 1;
                trace!(from, to, message = message.type_name(), "Message dropped by mutator");
                return;
            }
        };

        // Partition check is deterministic and does not consume RNG.
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from, to, "Message dropped due to partition");
            return;
        }
        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from, to, "Message dropped due to packet loss");
            return;
        }

        let latency = self.network.sample_latency(&mut self.rng);
        let event = Event::MessageReceived {
            sender: ValidatorId(from as u64),
            message,
        };
        self.schedule_event(to, self.now + latency + extra, event);
        self.stats.messages_sent += 1;
    }
}

/// Convert a timer ID to an event.
fn timer_to_event(id: TimerId) -> Event {
    match id {
        TimerId::LocalTimeout { epoch, view } => Event::LocalTimeout { epoch, view },
        TimerId::SyncRetry { epoch, vertex_hash } => Event::SyncTimeout { epoch, vertex_hash },
    }
}
