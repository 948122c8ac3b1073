//! Simulated network with deterministic latency, packet loss, partitions and
//! message mutators.

use crate::NodeIndex;
use concord_core::ConsensusMessage;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Number of validators.
    pub num_validators: u32,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this probability.
    pub packet_loss_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter_fraction: 0.1,
            num_validators: 4,
            packet_loss_rate: 0.0,
        }
    }
}

/// Where a message is going when a mutator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub from: NodeIndex,
    pub to: NodeIndex,
    /// Simulation time the message was sent at.
    pub now: Duration,
}

/// What a mutator decided for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Deliver,
    /// Deliver after the sampled latency plus this much.
    Delay(Duration),
    Drop,
}

/// Inspects and possibly rewrites one message per recipient.
///
/// Mutators run in registration order on the recipient's copy. The first
/// `Drop` wins and delays add up. Observers are mutators that only look.
pub type MessageMutator = Box<dyn FnMut(&MessageInfo, &mut ConsensusMessage) -> Delivery + Send>;

/// Simulated network for deterministic message delivery.
///
/// Supports:
/// - Configurable latency with jitter
/// - Packet loss (probabilistic message drops)
/// - Network partitions (blocking communication between node pairs)
/// - Message mutators (targeted drops, delays and rewrites)
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned node pairs. If (a, b) is in this set, messages from a to b are dropped.
    /// Partitions are directional - add both (a, b) and (b, a) for bidirectional partition.
    partitions: HashSet<(NodeIndex, NodeIndex)>,
    mutators: Vec<MessageMutator>,
}

impl std::fmt::Debug for SimulatedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedNetwork")
            .field("config", &self.config)
            .field("partitions", &self.partitions.len())
            .field("mutators", &self.mutators.len())
            .finish()
    }
}

impl SimulatedNetwork {
    /// Create a new simulated network.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
            mutators: Vec::new(),
        }
    }

    // ─── Partition Management ───

    /// Check if two nodes are partitioned (message from `from` to `to` would be dropped).
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Create a unidirectional partition: messages from `from` to `to` are dropped.
    pub fn partition_unidirectional(&mut self, from: NodeIndex, to: NodeIndex) {
        self.partitions.insert((from, to));
    }

    /// Create a bidirectional partition between two nodes.
    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Create a bidirectional partition between two groups of nodes.
    pub fn partition_groups(&mut self, group_a: &[NodeIndex], group_b: &[NodeIndex]) {
        for &a in group_a {
            for &b in group_b {
                self.partitions.insert((a, b));
                self.partitions.insert((b, a));
            }
        }
    }

    /// Isolate a node from all other nodes in the network.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        for other in self.all_nodes() {
            if other != node {
                self.partitions.insert((node, other));
                self.partitions.insert((other, node));
            }
        }
    }

    /// Heal a bidirectional partition between two nodes.
    pub fn heal_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.remove(&(a, b));
        self.partitions.remove(&(b, a));
    }

    /// Heal all partitions - restore full network connectivity.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    /// Get the number of active partition pairs.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Packet Loss ───

    /// Check if a packet should be dropped based on the configured loss rate.
    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate
    }

    /// Set the packet loss rate (0.0 - 1.0).
    pub fn set_packet_loss_rate(&mut self, rate: f64) {
        self.config.packet_loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn packet_loss_rate(&self) -> f64 {
        self.config.packet_loss_rate
    }

    // ─── Mutators ───

    /// Register a mutator applied to every message sent from now on.
    pub fn add_mutator(&mut self, mutator: MessageMutator) {
        self.mutators.push(mutator);
    }

    pub fn clear_mutators(&mut self) {
        self.mutators.clear();
    }

    /// Run the mutators over one recipient's copy of a message.
    pub fn mutate(&mut self, info: &MessageInfo, message: &mut ConsensusMessage) -> Delivery {
        let mut extra = Duration::ZERO;
        for mutator in &mut self.mutators {
            match mutator(info, message) {
                Delivery::Deliver => {}
                Delivery::Delay(d) => extra += d,
                Delivery::Drop => return Delivery::Drop,
            }
        }
        if extra.is_zero() {
            Delivery::Deliver
        } else {
            Delivery::Delay(extra)
        }
    }

    // ─── Message Delivery Decision ───

    /// Determine if a message should be delivered from `from` to `to`.
    /// Returns `None` if the message should be dropped (partition or packet loss).
    /// Returns `Some(latency)` if the message should be delivered.
    pub fn should_deliver(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        if self.is_partitioned(from, to) {
            return None;
        }
        if self.should_drop_packet(rng) {
            return None;
        }
        Some(self.sample_latency(rng))
    }

    /// Sample latency for one message.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency;
        let jitter_range = base.as_secs_f64() * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        let latency_secs = (base.as_secs_f64() + jitter).max(0.001);
        Duration::from_secs_f64(latency_secs)
    }

    /// Get all nodes in the network.
    pub fn all_nodes(&self) -> Vec<NodeIndex> {
        (0..self.config.num_validators).collect()
    }

    pub fn total_nodes(&self) -> usize {
        self.config.num_validators as usize
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::{EpochId, Hash};
    use rand::SeedableRng;

    fn request() -> ConsensusMessage {
        ConsensusMessage::SyncRequest {
            epoch: EpochId(0),
            vertex_hash: Hash::from_bytes(b"v"),
            count: 1,
        }
    }

    fn info(from: NodeIndex, to: NodeIndex) -> MessageInfo {
        MessageInfo {
            from,
            to,
            now: Duration::ZERO,
        }
    }

    #[test]
    fn test_deterministic_latency() {
        let network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);

        assert_eq!(
            network.sample_latency(&mut rng1),
            network.sample_latency(&mut rng2),
            "Same seed should produce same latency"
        );
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let network = SimulatedNetwork::new(NetworkConfig {
            jitter_fraction: 0.0,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(network.sample_latency(&mut rng), Duration::from_millis(50));
    }

    // ─── Partition Tests ───

    #[test]
    fn test_unidirectional_partition() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());

        network.partition_unidirectional(0, 1);
        assert!(network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(1, 0));

        network.heal_all();
        assert!(!network.is_partitioned(0, 1));
    }

    #[test]
    fn test_group_partition() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());

        network.partition_groups(&[0, 1], &[2, 3]);
        assert!(network.is_partitioned(0, 2));
        assert!(network.is_partitioned(3, 1));
        assert!(!network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(2, 3));

        network.heal_bidirectional(0, 2);
        assert!(!network.is_partitioned(2, 0));
        assert_eq!(network.partition_count(), 6);
    }

    #[test]
    fn test_isolate_node() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());

        network.isolate_node(0);
        for other in 1..4 {
            assert!(network.is_partitioned(0, other));
            assert!(network.is_partitioned(other, 0));
        }
        assert!(!network.is_partitioned(1, 2));
    }

    // ─── Packet Loss Tests ───

    #[test]
    fn test_packet_loss_rate() {
        let mut network = SimulatedNetwork::new(NetworkConfig {
            packet_loss_rate: 0.5,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let iterations = 10000;
        let drops = (0..iterations)
            .filter(|_| network.should_drop_packet(&mut rng))
            .count();
        let drop_rate = drops as f64 / iterations as f64;
        assert!(
            (0.45..0.55).contains(&drop_rate),
            "Expected ~50% drop rate, got {:.2}%",
            drop_rate * 100.0
        );

        network.set_packet_loss_rate(1.5);
        assert_eq!(network.packet_loss_rate(), 1.0);
        network.set_packet_loss_rate(-0.5);
        assert_eq!(network.packet_loss_rate(), 0.0);
    }

    #[test]
    fn test_partition_takes_precedence_over_packet_loss() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        assert!(network.should_deliver(0, 1, &mut rng).is_some());
        network.partition_bidirectional(0, 1);
        assert!(network.should_deliver(0, 1, &mut rng).is_none());
        assert!(network.should_deliver(0, 2, &mut rng).is_some());
    }

    // ─── Mutator Tests ───

    #[test]
    fn test_mutators_compose() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        let mut msg = request();
        assert_eq!(network.mutate(&info(0, 1), &mut msg), Delivery::Deliver);

        network.add_mutator(Box::new(|_, _| Delivery::Delay(Duration::from_millis(5))));
        network.add_mutator(Box::new(|_, _| Delivery::Delay(Duration::from_millis(7))));
        assert_eq!(
            network.mutate(&info(0, 1), &mut msg),
            Delivery::Delay(Duration::from_millis(12))
        );

        network.add_mutator(Box::new(|info, _| {
            if info.to == 2 {
                Delivery::Drop
            } else {
                Delivery::Deliver
            }
        }));
        assert_eq!(network.mutate(&info(0, 2), &mut msg), Delivery::Drop);

        network.clear_mutators();
        assert_eq!(network.mutate(&info(0, 2), &mut msg), Delivery::Deliver);
    }

    #[test]
    fn test_mutator_rewrites_recipient_copy() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.add_mutator(Box::new(|_, msg| {
            if let ConsensusMessage::SyncRequest { count, .. } = msg {
                *count = 99;
            }
            Delivery::Deliver
        }));
        let mut msg = request();
        network.mutate(&info(0, 1), &mut msg);
        assert!(matches!(msg, ConsensusMessage::SyncRequest { count: 99, .. }));
    }
}
