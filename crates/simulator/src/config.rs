//! Simulator configuration.

use concord_bft::BftConfig;
use concord_simulation::{NetworkConfig, NodeIndex, SimulationConfig};
use std::time::Duration;

/// A fault injected at a point in simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Stop a node, dropping its queued events and timers.
    Crash { node: NodeIndex, at: Duration },
    /// Rebuild a crashed node from its safety store.
    Restart { node: NodeIndex, at: Duration },
    /// Cut a node off from every other node.
    Isolate { node: NodeIndex, at: Duration },
    /// Remove all partitions.
    HealAll { at: Duration },
}

impl Fault {
    pub fn at(&self) -> Duration {
        match self {
            Fault::Crash { at, .. }
            | Fault::Restart { at, .. }
            | Fault::Isolate { at, .. }
            | Fault::HealAll { at } => *at,
        }
    }
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Voting power per validator.
    pub weights: Vec<u64>,
    /// Views per epoch. Zero disables epoch changes.
    pub epoch_length: u64,
    pub commands_per_vertex: usize,
    pub bft: BftConfig,
    pub network: NetworkConfig,
    /// Random seed for deterministic simulation.
    pub seed: u64,
    /// Faults, applied in time order.
    pub faults: Vec<Fault>,
    /// How often to sample progress.
    pub sample_interval: Duration,
}

impl SimulatorConfig {
    /// `validators` validators of equal weight.
    pub fn new(validators: usize) -> Self {
        Self {
            weights: vec![1; validators],
            epoch_length: 0,
            commands_per_vertex: 1,
            bft: BftConfig::default(),
            network: NetworkConfig::default(),
            seed: 42,
            faults: Vec::new(),
            sample_interval: Duration::from_secs(1),
        }
    }

    pub fn with_weights(mut self, weights: Vec<u64>) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_epoch_length(mut self, views: u64) -> Self {
        self.epoch_length = views;
        self
    }

    pub fn with_commands_per_vertex(mut self, count: usize) -> Self {
        self.commands_per_vertex = count;
        self
    }

    pub fn with_bft(mut self, bft: BftConfig) -> Self {
        self.bft = bft;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub(crate) fn to_simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            weights: self.weights.clone(),
            epoch_length: self.epoch_length,
            commands_per_vertex: self.commands_per_vertex,
            bft: self.bft.clone(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::new(4)
    }
}
