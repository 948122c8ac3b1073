//! Metrics collection and reporting for simulations.
//!
//! Tracks commit throughput over time, the distribution of intervals
//! between consecutive commits at each node, and a per-node summary.

use concord_simulation::SimulationStats;
use hdrhistogram::{CreationError, Histogram};
use std::time::Duration;
use tracing::warn;

/// Collects metrics during a simulation run.
pub struct MetricsCollector {
    /// Intervals between consecutive commits at a node (microseconds).
    interval_histogram: Histogram<u64>,

    /// Start time (simulated).
    start_time: Duration,

    /// Peak commits per second observed in any sample window.
    peak_commit_rate: f64,

    samples: Vec<MetricsSample>,

    last_sample_time: Duration,

    /// Committed vertices at the slowest node at last sample.
    last_sample_commits: u64,
}

impl MetricsCollector {
    pub fn new(start_time: Duration) -> Result<Self, CreationError> {
        Ok(Self {
            // Three significant digits; auto-resizes for long intervals.
            interval_histogram: Histogram::new(3)?,
            start_time,
            peak_commit_rate: 0.0,
            samples: Vec::new(),
            last_sample_time: start_time,
            last_sample_commits: 0,
        })
    }

    /// Record the time a node waited between two commits.
    pub fn record_commit_interval(&mut self, interval: Duration) {
        let micros = interval.as_micros().min(u64::MAX as u128) as u64;
        if let Err(e) = self.interval_histogram.record(micros) {
            warn!(error = %e, micros, "Commit interval not recorded");
        }
    }

    /// Take a point-in-time sample.
    ///
    /// `min_commits` is the commit count of the slowest running node.
    pub fn sample(&mut self, current_time: Duration, min_commits: u64, min_view: u64) {
        let elapsed_since_last = current_time.saturating_sub(self.last_sample_time);
        let commits_since_last = min_commits.saturating_sub(self.last_sample_commits);

        let commit_rate = if elapsed_since_last.as_secs_f64() > 0.0 {
            commits_since_last as f64 / elapsed_since_last.as_secs_f64()
        } else {
            0.0
        };
        if commit_rate > self.peak_commit_rate {
            self.peak_commit_rate = commit_rate;
        }

        self.samples.push(MetricsSample {
            time: current_time,
            min_commits,
            min_view,
            commit_rate,
        });

        self.last_sample_time = current_time;
        self.last_sample_commits = min_commits;
    }

    /// Finalize and generate a report.
    pub fn finalize(
        self,
        end_time: Duration,
        nodes: Vec<NodeReport>,
        network: SimulationStats,
        fork: Option<(u32, u32, usize)>,
    ) -> SimulationReport {
        let total_duration = end_time.saturating_sub(self.start_time);
        let min_commits = nodes
            .iter()
            .filter(|n| n.running)
            .map(|n| n.committed)
            .min()
            .unwrap_or(0);
        let average_commit_rate = if total_duration.as_secs_f64() > 0.0 {
            min_commits as f64 / total_duration.as_secs_f64()
        } else {
            0.0
        };

        SimulationReport {
            total_duration,
            min_commits,
            average_commit_rate,
            peak_commit_rate: self.peak_commit_rate,
            interval_histogram: self.interval_histogram,
            samples: self.samples,
            nodes,
            network,
            fork,
        }
    }
}

/// A point-in-time metrics sample.
#[derive(Clone, Debug)]
pub struct MetricsSample {
    /// Simulation time of this sample.
    pub time: Duration,
    /// Commits at the slowest running node.
    pub min_commits: u64,
    /// Lowest current view among running nodes.
    pub min_view: u64,
    /// Commits per second since the previous sample.
    pub commit_rate: f64,
}

/// Final state of one node.
#[derive(Clone, Debug)]
pub struct NodeReport {
    pub index: u32,
    /// False if the node was crashed at the end.
    pub running: bool,
    pub epoch: u64,
    pub view: u64,
    /// Vertices in the node's commit log.
    pub committed: u64,
    pub vote_quorums: u64,
    pub timeout_quorums: u64,
    pub safety_refusals: u64,
    pub invalid_messages: u64,
    pub halted: Option<String>,
}

/// Final simulation report.
pub struct SimulationReport {
    pub total_duration: Duration,
    /// Commits at the slowest running node.
    pub min_commits: u64,
    /// Commits per second at the slowest running node.
    pub average_commit_rate: f64,
    pub peak_commit_rate: f64,
    /// Commit interval histogram (values in microseconds).
    interval_histogram: Histogram<u64>,
    pub samples: Vec<MetricsSample>,
    pub nodes: Vec<NodeReport>,
    pub network: SimulationStats,
    /// First pair of nodes with diverging commit logs, and the position.
    pub fork: Option<(u32, u32, usize)>,
}

impl SimulationReport {
    fn interval_at(&self, quantile: f64) -> Duration {
        Duration::from_micros(self.interval_histogram.value_at_quantile(quantile))
    }

    pub fn p50_commit_interval(&self) -> Duration {
        self.interval_at(0.50)
    }

    pub fn p90_commit_interval(&self) -> Duration {
        self.interval_at(0.90)
    }

    pub fn p99_commit_interval(&self) -> Duration {
        self.interval_at(0.99)
    }

    pub fn max_commit_interval(&self) -> Duration {
        Duration::from_micros(self.interval_histogram.max())
    }

    /// Number of commit intervals recorded.
    pub fn commit_interval_count(&self) -> u64 {
        self.interval_histogram.len()
    }

    /// Fraction of views left through a timeout certificate, across nodes.
    pub fn timeout_ratio(&self) -> f64 {
        let (qcs, tcs) = self.nodes.iter().fold((0, 0), |(q, t), n| {
            (q + n.vote_quorums, t + n.timeout_quorums)
        });
        if qcs + tcs == 0 {
            0.0
        } else {
            tcs as f64 / (qcs + tcs) as f64
        }
    }

    pub fn print_summary(&self) {
        println!("\n═══════════════════════════════════════════");
        println!("           SIMULATION REPORT                ");
        println!("═══════════════════════════════════════════");
        println!();
        println!("Duration: {:?}", self.total_duration);
        println!();
        println!("Commits (slowest node):");
        println!("  Total:        {}", self.min_commits);
        println!("  Average/sec:  {:.2}", self.average_commit_rate);
        println!("  Peak/sec:     {:.2}", self.peak_commit_rate);
        println!();
        println!("Commit interval ({} samples):", self.commit_interval_count());
        println!("  P50:  {:?}", self.p50_commit_interval());
        println!("  P90:  {:?}", self.p90_commit_interval());
        println!("  P99:  {:?}", self.p99_commit_interval());
        println!("  Max:  {:?}", self.max_commit_interval());
        println!();
        println!("Views:");
        println!("  Timeout ratio: {:.3}", self.timeout_ratio());
        println!();
        println!("Network:");
        println!("  Sent:      {}", self.network.messages_sent);
        println!("  Dropped:   {}", self.network.messages_dropped());
        println!("  Delivery:  {:.3}", self.network.delivery_rate());
        println!();
        println!("Nodes:");
        for node in &self.nodes {
            let status = match (&node.halted, node.running) {
                (Some(reason), _) => format!("halted ({reason})"),
                (None, false) => "crashed".to_string(),
                (None, true) => "running".to_string(),
            };
            println!(
                "  {:>3}: epoch {} view {:>5} commits {:>6} qc {:>5} tc {:>5} refusals {} invalid {} {}",
                node.index,
                node.epoch,
                node.view,
                node.committed,
                node.vote_quorums,
                node.timeout_quorums,
                node.safety_refusals,
                node.invalid_messages,
                status
            );
        }
        println!();
        match self.fork {
            Some((a, b, at)) => println!("SAFETY VIOLATION: nodes {a} and {b} diverge at commit {at}"),
            None => println!("Safety: no fork"),
        }
        println!("═══════════════════════════════════════════");
    }
}
