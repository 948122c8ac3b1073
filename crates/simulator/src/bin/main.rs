//! Concord Deterministic Simulator CLI
//!
//! Run consensus simulations with configurable validators, network and
//! faults.
//!
//! # Example
//!
//! ```bash
//! # Four equal validators for 60 seconds
//! concord-sim --duration 60
//!
//! # Weighted validators, lossy network, node 3 crashes at 5s and returns at 15s
//! concord-sim --weights 1,2,3,4 --loss 0.05 --crash 3@5000 --restart 3@15000
//!
//! # Sweep 20 seeds and fail on any fork
//! concord-sim --seeds 20 --duration 30
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use concord_bft::BftConfig;
use concord_simulation::NetworkConfig;
use concord_simulator::{Fault, Simulator, SimulatorConfig};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Concord Deterministic Simulator
///
/// Runs consensus in a fully deterministic environment.
/// Given the same seed, produces identical results every run.
#[derive(Parser, Debug)]
#[command(name = "concord-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of equally weighted validators
    #[arg(short = 'v', long, default_value = "4")]
    validators: usize,

    /// Comma-separated voting powers; overrides --validators
    #[arg(short = 'w', long, value_delimiter = ',')]
    weights: Vec<u64>,

    /// Simulation duration in seconds
    #[arg(short = 'd', long, default_value = "30")]
    duration: u64,

    /// Random seed for deterministic simulation
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Run this many consecutive seeds starting at --seed
    #[arg(long, default_value = "1")]
    seeds: u64,

    /// One-way network latency in milliseconds
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// Latency jitter as a fraction of the latency (0.0-1.0)
    #[arg(long, default_value = "0.1")]
    jitter: f64,

    /// Packet loss rate (0.0-1.0)
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Base view timeout in milliseconds
    #[arg(long)]
    base_timeout_ms: Option<u64>,

    /// Views per epoch (0 disables epoch changes)
    #[arg(long, default_value = "0")]
    epoch_length: u64,

    /// Commands per proposed vertex
    #[arg(long, default_value = "1")]
    commands: usize,

    /// Crash a node: NODE@MILLIS (repeatable)
    #[arg(long, value_parser = parse_node_at)]
    crash: Vec<(u32, u64)>,

    /// Restart a crashed node: NODE@MILLIS (repeatable)
    #[arg(long, value_parser = parse_node_at)]
    restart: Vec<(u32, u64)>,

    /// Isolate a node from all others: NODE@MILLIS (repeatable)
    #[arg(long, value_parser = parse_node_at)]
    isolate: Vec<(u32, u64)>,

    /// Heal all partitions at MILLIS (repeatable)
    #[arg(long)]
    heal: Vec<u64>,
}

fn parse_node_at(s: &str) -> Result<(u32, u64), String> {
    let (node, at) = s
        .split_once('@')
        .ok_or_else(|| format!("expected NODE@MILLIS, got {s:?}"))?;
    let node = node.parse().map_err(|e| format!("bad node {node:?}: {e}"))?;
    let at = at.parse().map_err(|e| format!("bad time {at:?}: {e}"))?;
    Ok((node, at))
}

impl Args {
    fn config(&self, seed: u64) -> SimulatorConfig {
        let weights = if self.weights.is_empty() {
            vec![1; self.validators]
        } else {
            self.weights.clone()
        };

        let mut bft = BftConfig::default();
        if let Some(ms) = self.base_timeout_ms {
            bft = bft.with_base_timeout(Duration::from_millis(ms));
        }

        let network = NetworkConfig {
            latency: Duration::from_millis(self.latency_ms),
            jitter_fraction: self.jitter,
            packet_loss_rate: self.loss,
            ..Default::default()
        };

        let mut config = SimulatorConfig::new(weights.len())
            .with_weights(weights)
            .with_seed(seed)
            .with_epoch_length(self.epoch_length)
            .with_commands_per_vertex(self.commands)
            .with_bft(bft)
            .with_network(network);

        let at = Duration::from_millis;
        for &(node, ms) in &self.crash {
            config = config.with_fault(Fault::Crash { node, at: at(ms) });
        }
        for &(node, ms) in &self.restart {
            config = config.with_fault(Fault::Restart { node, at: at(ms) });
        }
        for &(node, ms) in &self.isolate {
            config = config.with_fault(Fault::Isolate { node, at: at(ms) });
        }
        for &ms in &self.heal {
            config = config.with_fault(Fault::HealAll { at: at(ms) });
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,concord_simulator=info")),
        )
        .init();

    let args = Args::parse();
    if args.weights.is_empty() && args.validators == 0 {
        bail!("at least one validator is required");
    }

    for seed in args.seed..args.seed + args.seeds.max(1) {
        info!(
            seed,
            validators = args.weights.len().max(args.validators),
            duration_secs = args.duration,
            loss = args.loss,
            "Starting simulation"
        );

        let mut simulator = Simulator::new(args.config(seed))
            .with_context(|| format!("failed to create simulator for seed {seed}"))?;
        let report = simulator
            .run_for(Duration::from_secs(args.duration))
            .with_context(|| format!("simulation with seed {seed} failed"))?;
        report.print_summary();

        if let Some((a, b, at)) = report.fork {
            bail!("seed {seed}: nodes {a} and {b} committed different vertices at position {at}");
        }
    }
    Ok(())
}
