//! Main simulator runner.
//!
//! Drives a [`SimulationRunner`] for a fixed stretch of simulated time,
//! injecting the configured faults and collecting commit metrics.

use crate::config::{Fault, SimulatorConfig};
use crate::metrics::{MetricsCollector, NodeReport, SimulationReport};
use concord_node::NodeError;
use concord_simulation::{NodeIndex, SimulationRunner};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the simulator.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("node setup failed: {0}")]
    Node(#[from] NodeError),
    #[error("metrics setup failed: {0}")]
    Metrics(#[from] hdrhistogram::CreationError),
}

/// Commit progress last observed at one node.
#[derive(Debug, Clone, Copy, Default)]
struct CommitProgress {
    count: usize,
    last_commit: Option<Duration>,
}

/// Main simulator that orchestrates faults and metrics collection.
pub struct Simulator {
    /// Underlying deterministic simulation runner.
    runner: SimulationRunner,

    config: SimulatorConfig,

    /// Faults not yet applied, in time order.
    pending_faults: VecDeque<Fault>,

    progress: Vec<CommitProgress>,

    /// Value of `commits_emitted` at the last observation.
    observed_commits: u64,

    started: bool,
}

impl Simulator {
    /// Create a new simulator with the given configuration.
    pub fn new(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        let runner = SimulationRunner::new(
            config.to_simulation_config(),
            config.network.clone(),
            config.seed,
        )?;

        let mut faults = config.faults.clone();
        faults.sort_by_key(Fault::at);

        info!(
            validators = config.weights.len(),
            epoch_length = config.epoch_length,
            faults = faults.len(),
            seed = config.seed,
            "Simulator created"
        );

        Ok(Self {
            progress: vec![CommitProgress::default(); runner.num_nodes()],
            runner,
            config,
            pending_faults: faults.into(),
            observed_commits: 0,
            started: false,
        })
    }

    pub fn runner(&self) -> &SimulationRunner {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut SimulationRunner {
        &mut self.runner
    }

    /// Run the simulation for the specified duration.
    ///
    /// Nodes are started on the first call. Later calls continue from where
    /// the previous one stopped.
    pub fn run_for(&mut self, duration: Duration) -> Result<SimulationReport, SimulatorError> {
        if !self.started {
            self.runner.start_all();
            self.started = true;
        }

        let start_time = self.runner.now();
        let end_time = start_time + duration;
        let sample_interval = self.config.sample_interval.max(Duration::from_millis(1));
        let mut metrics = MetricsCollector::new(start_time)?;
        let mut next_sample = start_time + sample_interval;

        info!(
            duration_secs = duration.as_secs_f64(),
            sample_interval_ms = sample_interval.as_millis() as u64,
            "Starting simulation"
        );

        while self.runner.now() < end_time {
            let boundary = [self.next_fault_time(), Some(next_sample), Some(end_time)]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(end_time);

            while self.runner.peek_time().is_some_and(|t| t <= boundary) {
                if let Some((key, event)) = self.runner.next_event() {
                    self.runner.step(key, event);
                    self.observe_commits(&mut metrics);
                }
            }
            self.runner.run_until(boundary);

            self.apply_due_faults()?;

            if self.runner.now() >= next_sample {
                self.take_sample(&mut metrics);
                next_sample += sample_interval;
            }
        }

        let end_time = self.runner.now();
        info!(
            total_time_secs = (end_time - start_time).as_secs_f64(),
            "Simulation complete"
        );

        let fork = self.runner.find_fork();
        if let Some((a, b, at)) = fork {
            warn!(a, b, at, "Commit logs diverged");
        }
        Ok(metrics.finalize(
            end_time,
            self.node_reports(),
            self.runner.stats().clone(),
            fork,
        ))
    }

    fn next_fault_time(&self) -> Option<Duration> {
        self.pending_faults.front().map(Fault::at)
    }

    fn apply_due_faults(&mut self) -> Result<(), SimulatorError> {
        let now = self.runner.now();
        while self.pending_faults.front().is_some_and(|f| f.at() <= now) {
            let Some(fault) = self.pending_faults.pop_front() else {
                break;
            };
            info!(?fault, time = ?now, "Applying fault");
            match fault {
                Fault::Crash { node, .. } => self.runner.crash(node),
                Fault::Restart { node, .. } => {
                    self.runner.restart(node)?;
                    self.reset_progress(node);
                }
                Fault::Isolate { node, .. } => self.runner.network_mut().isolate_node(node),
                Fault::HealAll { .. } => self.runner.network_mut().heal_all(),
            }
        }
        Ok(())
    }

    fn reset_progress(&mut self, node: NodeIndex) {
        if let Some(progress) = self.progress.get_mut(node as usize) {
            *progress = CommitProgress::default();
        }
    }

    /// Record the time since each node's previous commit notification.
    fn observe_commits(&mut self, metrics: &mut MetricsCollector) {
        let emitted = self.runner.stats().commits_emitted;
        if emitted == self.observed_commits {
            return;
        }
        self.observed_commits = emitted;

        let now = self.runner.now();
        for (index, progress) in self.progress.iter_mut().enumerate() {
            let count = self.runner.committed(index as NodeIndex).len();
            if count <= progress.count {
                continue;
            }
            if let Some(last) = progress.last_commit {
                metrics.record_commit_interval(now.saturating_sub(last));
            }
            debug!(node = index, count, time = ?now, "Commit observed");
            progress.count = count;
            progress.last_commit = Some(now);
        }
    }

    fn take_sample(&mut self, metrics: &mut MetricsCollector) {
        let running: Vec<NodeIndex> = (0..self.runner.num_nodes() as NodeIndex)
            .filter(|&i| self.runner.node(i).is_some())
            .collect();
        let min_commits = running
            .iter()
            .map(|&i| self.runner.committed(i).len() as u64)
            .min()
            .unwrap_or(0);
        let min_view = self
            .runner
            .min_progress()
            .map(|(_, view)| view.0)
            .unwrap_or(0);

        metrics.sample(self.runner.now(), min_commits, min_view);
        info!(
            time = ?self.runner.now(),
            running = running.len(),
            min_commits,
            min_view,
            "Progress"
        );
    }

    fn node_reports(&self) -> Vec<NodeReport> {
        (0..self.runner.num_nodes() as NodeIndex)
            .map(|index| {
                let node = self.runner.node(index);
                let stats = node.map(|n| n.stats()).unwrap_or_default();
                NodeReport {
                    index,
                    running: node.is_some(),
                    epoch: stats.epoch,
                    view: stats.current_view,
                    committed: self.runner.committed(index).len() as u64,
                    vote_quorums: stats.vote_quorums,
                    timeout_quorums: stats.timeout_quorums,
                    safety_refusals: stats.safety_refusals,
                    invalid_messages: stats.invalid_messages,
                    halted: self.runner.halt_reason(index).map(str::to_string),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_simulation::NetworkConfig;

    fn quiet_network() -> NetworkConfig {
        NetworkConfig {
            latency: Duration::from_millis(20),
            jitter_fraction: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_faults_applied_in_time_order() {
        let config = SimulatorConfig::new(4)
            .with_network(quiet_network())
            .with_fault(Fault::Restart {
                node: 2,
                at: Duration::from_millis(1_500),
            })
            .with_fault(Fault::Crash {
                node: 2,
                at: Duration::from_millis(500),
            });
        let mut simulator = Simulator::new(config).unwrap();

        simulator.run_for(Duration::from_secs(1)).unwrap();
        assert!(simulator.runner().node(2).is_none());
        assert_eq!(simulator.pending_faults.len(), 1);

        simulator.run_for(Duration::from_secs(1)).unwrap();
        assert!(simulator.runner().node(2).is_some());
        assert!(simulator.pending_faults.is_empty());
    }

    #[test]
    fn test_one_sample_per_interval() {
        let config = SimulatorConfig::new(4)
            .with_network(quiet_network())
            .with_sample_interval(Duration::from_millis(250));
        let mut simulator = Simulator::new(config).unwrap();

        let report = simulator.run_for(Duration::from_secs(2)).unwrap();
        assert_eq!(report.samples.len(), 8);
        assert_eq!(report.samples[0].time, Duration::from_millis(250));
        assert!(report.min_commits > 0);
        assert!(report.commit_interval_count() > 0);
    }
}
