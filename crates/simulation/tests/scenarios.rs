//! Targeted protocol scenarios.
//!
//! Each test shapes the network with mutators to force one specific path
//! through the protocol and checks the resulting certificates and stats.

use concord_bft::ProposerElection;
use concord_core::ConsensusMessage;
use concord_simulation::{
    Delivery, MessageInfo, NetworkConfig, SimulationConfig, SimulationRunner,
};
use concord_types::test_utils::validator_set;
use concord_types::{HighQc, ValidatorId, View, Vote};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn steady_network() -> NetworkConfig {
    NetworkConfig {
        latency: Duration::from_millis(50),
        jitter_fraction: 0.0,
        ..Default::default()
    }
}

fn runner(seed: u64) -> SimulationRunner {
    SimulationRunner::new(SimulationConfig::default(), steady_network(), seed)
        .expect("valid simulation config")
}

/// Everything the network saw that matters for these scenarios.
#[derive(Debug, Default)]
struct Observed {
    /// Timeout votes by view.
    timeouts: HashMap<View, Vec<Vote>>,
    /// Views of every QC carried by any message.
    qc_views: BTreeSet<View>,
}

impl Observed {
    fn note_high_qc(&mut self, high_qc: &HighQc) {
        self.qc_views.insert(high_qc.highest_qc.view());
        self.qc_views.insert(high_qc.highest_committed_qc.view());
    }

    fn record(&mut self, message: &ConsensusMessage) {
        match message {
            ConsensusMessage::Proposal(proposal) => {
                self.qc_views.insert(proposal.vertex.parent_qc.view());
                self.note_high_qc(&proposal.high_qc);
            }
            ConsensusMessage::Vote(vote) => self.note_high_qc(&vote.high_qc),
            ConsensusMessage::Timeout(vote) => {
                self.note_high_qc(&vote.high_qc);
                let seen = self.timeouts.entry(vote.view()).or_default();
                if !seen.iter().any(|v| v.author == vote.author) {
                    seen.push(vote.clone());
                }
            }
            ConsensusMessage::ViewUpdate { high_qc, .. } => self.note_high_qc(high_qc),
            _ => {}
        }
    }

    fn timeout_authors(&self, view: View) -> BTreeSet<ValidatorId> {
        self.timeouts
            .get(&view)
            .map(|votes| votes.iter().map(|v| v.author).collect())
            .unwrap_or_default()
    }
}

/// Install an observer. Mutators run in order, so install it first to see
/// messages before any later mutator rewrites them.
fn observe(runner: &mut SimulationRunner) -> Arc<Mutex<Observed>> {
    let observed = Arc::new(Mutex::new(Observed::default()));
    let sink = observed.clone();
    runner.network_mut().add_mutator(Box::new(move |_, message| {
        sink.lock().record(message);
        Delivery::Deliver
    }));
    observed
}

fn all_nodes() -> BTreeSet<ValidatorId> {
    (0..4).map(ValidatorId).collect()
}

#[traced_test]
#[test]
fn test_lost_votes_advance_by_timeout_certificates_only() {
    let mut runner = runner(11);
    runner.network_mut().add_mutator(Box::new(|_, message| match message {
        ConsensusMessage::Vote(_) => Delivery::Drop,
        _ => Delivery::Deliver,
    }));
    runner.start_all();

    let reached = runner.run_until_condition(Duration::from_secs(60), |r| {
        r.min_progress().is_some_and(|(_, view)| view >= View(8))
    });
    assert!(reached, "views stalled at {:?}", runner.min_progress());

    for node in 0..4 {
        let stats = runner.node(node).unwrap().stats();
        assert_eq!(stats.vote_quorums, 0, "node {node}");
        assert_eq!(stats.committed_vertices, 0, "node {node}");
        assert_eq!(stats.indirect_parent_commits, 0, "node {node}");
        assert_eq!(
            stats.timeout_quorums,
            stats.current_view - 1,
            "node {node} left some view without a TC"
        );
    }
    assert!(runner.stats().messages_dropped_mutator > 0);
}

#[test]
fn test_weighted_leader_frequency() {
    let weights: Vec<u64> = (0..100).map(|i| if i < 50 { 1 } else { 2 }).collect();
    let (validators, _) = validator_set(&weights);
    let election = ProposerElection::new(&validators);

    let mut counts: HashMap<ValidatorId, u64> = HashMap::new();
    for view in 1..=150_000 {
        *counts.entry(election.proposer(View(view))).or_default() += 1;
    }

    assert_eq!(counts.len(), 100);
    for (id, count) in counts {
        let expected = if id.0 < 50 { 1_000 } else { 2_000 };
        assert!(
            count.abs_diff(expected) <= 1,
            "{id} led {count} views, expected {expected}"
        );
    }
}

#[traced_test]
#[test]
fn test_leader_missing_proposal_times_out_on_genesis() {
    let mut runner = runner(12);
    let observed = observe(&mut runner);
    runner
        .network_mut()
        .add_mutator(Box::new(|info: &MessageInfo, message| match message {
            // Node 2 never sees the first proposal.
            ConsensusMessage::Proposal(p) if p.view() == View(1) && info.to == 2 => Delivery::Drop,
            // Node 2 can't catch up on its own before the timeouts land.
            ConsensusMessage::SyncRequest { .. } | ConsensusMessage::ViewUpdate { .. }
                if info.from == 2 && info.now < Duration::from_millis(2_500) =>
            {
                Delivery::Delay(Duration::from_secs(3))
            }
            _ => Delivery::Deliver,
        }));
    runner.start_all();
    runner.run_until(Duration::from_secs(20));

    let observed = observed.lock();
    let timeouts = &observed.timeouts[&View(1)];
    let from_node_2 = timeouts
        .iter()
        .find(|v| v.author == ValidatorId(2))
        .expect("node 2 timed out in view 1");
    assert_eq!(from_node_2.vote_data.proposed.view, View(1));
    assert_eq!(from_node_2.vote_data.parent.view, View::GENESIS);
    assert!(from_node_2.vote_data.committed.is_none());
    let key = runner.validators().public_key(ValidatorId(2)).unwrap();
    assert!(from_node_2.verify(key));

    assert_eq!(observed.timeout_authors(View(1)), all_nodes());
    assert!(observed.qc_views.contains(&View(2)));
    assert!(observed.qc_views.contains(&View(3)));

    for node in 0..4 {
        let stats = runner.node(node).unwrap().stats();
        assert!(stats.timeout_quorums >= 1, "node {node}");
        assert!(stats.current_view >= 4, "node {node}");
        assert!(!runner.committed(node).is_empty(), "node {node}");
    }
    assert_eq!(runner.find_fork(), None);
}

#[traced_test]
#[test]
fn test_tampered_qc_timestamps_rejected() {
    let mut runner = runner(13);
    let observed = observe(&mut runner);
    runner
        .network_mut()
        .add_mutator(Box::new(|info: &MessageInfo, message| {
            if let ConsensusMessage::Proposal(p) = message {
                if p.view() == View(2) && info.from == 2 {
                    let bump = info.to as u64 + 1;
                    for (_, sig) in p.vertex.parent_qc.signatures.iter_mut() {
                        sig.timestamp_ms += bump;
                    }
                    for (_, sig) in p.high_qc.highest_qc.signatures.iter_mut() {
                        sig.timestamp_ms += bump;
                    }
                }
            }
            Delivery::Deliver
        }));
    runner.start_all();
    runner.run_until(Duration::from_secs(20));

    let observed = observed.lock();
    assert!(!observed.qc_views.contains(&View(2)), "a QC for view 2 formed");
    assert_eq!(observed.timeout_authors(View(2)), all_nodes());

    for node in [0, 1, 3] {
        let stats = runner.node(node).unwrap().stats();
        assert!(stats.invalid_messages >= 1, "node {node} accepted the proposal");
    }
    for node in 0..4 {
        let stats = runner.node(node).unwrap().stats();
        assert!(stats.current_view > 4, "node {node}");
        assert!(!runner.committed(node).is_empty(), "node {node}");
    }
    assert_eq!(runner.find_fork(), None);
}
