//! Long-running consensus simulations with fault injection and metrics.
//!
//! Builds on [`concord_simulation::SimulationRunner`]: a [`Simulator`]
//! starts every node, applies a schedule of [`Fault`]s (crashes, restarts,
//! isolation) and reports commit throughput and commit intervals in a
//! [`SimulationReport`].

mod config;
mod metrics;
mod runner;

pub use config::{Fault, SimulatorConfig};
pub use metrics::{MetricsCollector, MetricsSample, NodeReport, SimulationReport};
pub use runner::{Simulator, SimulatorError};
