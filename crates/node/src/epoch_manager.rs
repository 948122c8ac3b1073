//! Epoch transitions.
//!
//! The manager owns the [`BftState`] of the current epoch. When a committed
//! vertex carries the next validator set, the current state is retired and a
//! new one is anchored at a genesis vertex built from that vertex's ledger
//! header. The retired epoch leaves behind an [`EpochProof`] used to answer
//! replicas still stuck in it.

use concord_bft::{BftState, BftStats, ConfigError, ReplicaContext};
use concord_core::{Action, ConsensusMessage, Event, SubStateMachine};
use concord_types::{
    EpochId, Hash, HighQc, LedgerHeader, PreparedVertex, SafetyState, ValidatorId, ValidatorSet,
    Vertex, View,
};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// What a replica needs to commit the end of a finished epoch.
#[derive(Debug, Clone)]
pub struct EpochProof {
    epoch: EpochId,
    /// Certificates at the moment the epoch ended.
    high_qc: HighQc,
    /// Vertices behind `high_qc`, descendant first.
    vertices: Vec<Vertex>,
}

impl EpochProof {
    fn capture(bft: &BftState, max_vertices: usize) -> Self {
        let high_qc = bft.store().high_qc();
        let vertices = bft
            .store()
            .get_vertices(&high_qc.highest_qc.vertex_hash(), max_vertices);
        Self {
            epoch: bft.epoch(),
            high_qc,
            vertices,
        }
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn high_qc(&self) -> &HighQc {
        &self.high_qc
    }

    pub fn view(&self) -> View {
        self.high_qc.highest_view()
    }

    /// Up to `count` vertices starting at `hash`, descendant first.
    pub fn vertices_from(&self, hash: &Hash, count: usize) -> Vec<Vertex> {
        self.vertices
            .iter()
            .position(|v| v.hash() == *hash)
            .map(|start| {
                self.vertices[start..]
                    .iter()
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Drives one [`BftState`] per epoch and switches between them.
pub struct EpochManager {
    ctx: ReplicaContext,
    current: BftState,
    proof: Option<EpochProof>,
    started: bool,
    now: Duration,
}

impl std::fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochManager")
            .field("self_id", &self.ctx.self_id)
            .field("current", &self.current)
            .field("proof_epoch", &self.proof.as_ref().map(EpochProof::epoch))
            .field("started", &self.started)
            .finish()
    }
}

impl EpochManager {
    /// Create a manager whose first epoch starts at `genesis_ledger`.
    pub fn new(
        ctx: ReplicaContext,
        genesis_ledger: LedgerHeader,
        validators: ValidatorSet,
        safety_state: Option<SafetyState>,
    ) -> Result<Self, ConfigError> {
        let current = BftState::new(
            &ctx,
            genesis_ledger,
            validators,
            safety_state,
            BftStats::default(),
        )?;
        Ok(Self {
            ctx,
            current,
            proof: None,
            started: false,
            now: Duration::ZERO,
        })
    }

    pub fn self_id(&self) -> ValidatorId {
        self.ctx.self_id
    }

    pub fn epoch(&self) -> EpochId {
        self.current.epoch()
    }

    /// State of the current epoch.
    pub fn bft(&self) -> &BftState {
        &self.current
    }

    /// Proof of the previous epoch, once one has ended.
    pub fn proof(&self) -> Option<&EpochProof> {
        self.proof.as_ref()
    }

    pub fn stats(&self) -> BftStats {
        self.current.stats()
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.current.set_time(now);
    }

    /// Route an event to the current epoch, answer it from the previous
    /// epoch's proof, or drop it.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let epoch = self.current.epoch();
        let actions = match &event {
            Event::Start => {
                self.started = true;
                self.current.try_handle(&event)
            }
            Event::LocalTimeout { epoch: e, .. } | Event::SyncTimeout { epoch: e, .. }
                if *e != epoch =>
            {
                trace!(event_epoch = e.0, epoch = epoch.0, "Dropping timer from other epoch");
                None
            }
            Event::MessageReceived { sender, message } if message.epoch() < epoch => {
                return self.on_stale_message(*sender, message);
            }
            Event::MessageReceived { message, .. } if message.epoch() > epoch => {
                trace!(
                    message = message.type_name(),
                    message_epoch = message.epoch().0,
                    epoch = epoch.0,
                    "Dropping message from future epoch"
                );
                None
            }
            _ => self.current.try_handle(&event),
        };
        let mut actions = actions.unwrap_or_default();

        let epoch_end = actions.iter().find_map(|action| match action {
            Action::EmitCommitted { vertices, .. } => vertices
                .iter()
                .find(|v| v.ledger.is_end_of_epoch())
                .cloned(),
            _ => None,
        });
        if let Some(end) = epoch_end {
            actions.extend(self.transition(end));
        }
        actions
    }

    /// Answer a replica that is still in the previous epoch.
    fn on_stale_message(&self, sender: ValidatorId, message: &ConsensusMessage) -> Vec<Action> {
        let Some(proof) = self.proof.as_ref().filter(|p| p.epoch == message.epoch()) else {
            trace!(
                message = message.type_name(),
                message_epoch = message.epoch().0,
                "Dropping message from retired epoch"
            );
            return vec![];
        };
        match message {
            ConsensusMessage::Timeout(_) | ConsensusMessage::ViewUpdate { .. } => {
                debug!(peer = %sender, epoch = proof.epoch.0, "Sending epoch proof to lagging peer");
                vec![Action::Send {
                    to: sender,
                    message: ConsensusMessage::ViewUpdate {
                        epoch: proof.epoch,
                        view: proof.view(),
                        high_qc: proof.high_qc.clone(),
                    },
                }]
            }
            ConsensusMessage::SyncRequest {
                vertex_hash, count, ..
            } => {
                let count = (*count).min(self.ctx.config.max_sync_batch);
                let vertices = proof.vertices_from(vertex_hash, count);
                if vertices.is_empty() {
                    return vec![];
                }
                vec![Action::Send {
                    to: sender,
                    message: ConsensusMessage::SyncResponse {
                        epoch: proof.epoch,
                        vertices,
                    },
                }]
            }
            _ => vec![],
        }
    }

    /// Retire the current epoch at `end` and start the next one.
    fn transition(&mut self, end: PreparedVertex) -> Vec<Action> {
        let (Some(genesis_ledger), Some(validators)) = (
            end.ledger.next_epoch_genesis(),
            end.ledger.next_validators.clone(),
        ) else {
            return vec![];
        };

        let proof = EpochProof::capture(&self.current, self.ctx.config.max_sync_batch);
        let safety_state = self.current.safety_state().clone();
        let stats = self.current.stats();
        let next = match BftState::new(
            &self.ctx,
            genesis_ledger,
            validators.clone(),
            Some(safety_state),
            stats,
        ) {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "Cannot build state for next epoch");
                return vec![Action::Halt {
                    reason: e.to_string(),
                }];
            }
        };

        let mut actions = self.current.stop();
        let old_epoch = self.current.epoch();
        self.current = next;
        self.current.set_time(self.now);
        self.proof = Some(proof);

        info!(
            validator = %self.ctx.self_id,
            from = old_epoch.0,
            to = self.current.epoch().0,
            validators = validators.len(),
            member = self.current.is_member(),
            "Epoch change"
        );
        actions.push(Action::EmitEpochChange {
            epoch: self.current.epoch(),
            validators,
        });
        if self.started {
            actions.extend(self.current.start());
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, pump, EpochLedger};
    use concord_types::test_utils::{genesis_ledger, validator_set};
    use concord_types::{Signature, Vote};
    use std::sync::Arc;

    fn managers(n: usize, epoch_length: u64) -> Vec<EpochManager> {
        let (validators, keys) = validator_set(&vec![1; n]);
        let ledger = Arc::new(EpochLedger::new(epoch_length, validators.clone()));
        keys.into_iter()
            .enumerate()
            .map(|(i, key)| {
                EpochManager::new(
                    context(i as u64, key, ledger.clone()),
                    genesis_ledger(EpochId(0)),
                    validators.clone(),
                    None,
                )
                .unwrap()
            })
            .collect()
    }

    fn start_all(n: usize) -> Vec<(usize, Event)> {
        (0..n).map(|i| (i, Event::Start)).collect()
    }

    #[test]
    fn test_all_replicas_change_epoch_and_keep_committing() {
        let mut nodes = managers(4, 3);
        let log = pump(&mut nodes, start_all(4), 3_000, |_, _, _| false);

        for (i, node) in nodes.iter().enumerate() {
            assert!(node.epoch() >= EpochId(1), "node {i} stuck in {}", node.epoch());
            assert!(node.proof().is_some());
            assert!(log.epoch_changes[i].contains(&EpochId(1)));
        }
        let stats = nodes[0].stats();
        assert!(stats.committed_vertices > 3);
    }

    #[test]
    fn test_future_epoch_messages_dropped() {
        let mut nodes = managers(4, 3);
        let stale = Event::SyncTimeout {
            epoch: EpochId(3),
            vertex_hash: Hash::ZERO,
        };
        assert!(nodes[0].handle(stale).is_empty());

        let update = ConsensusMessage::ViewUpdate {
            epoch: EpochId(2),
            view: View(1),
            high_qc: nodes[1].bft().store().high_qc(),
        };
        let actions = nodes[0].handle(Event::MessageReceived {
            sender: ValidatorId(1),
            message: update,
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn test_stale_timeout_answered_with_proof() {
        let mut nodes = managers(4, 3);
        pump(&mut nodes, start_all(4), 3_000, |_, _, _| false);
        assert!(nodes[0].epoch() >= EpochId(1));
        let proof = nodes[0].proof().cloned().unwrap();
        assert_eq!(proof.epoch(), EpochId(0));

        let timeout = ConsensusMessage::Timeout(stale_vote(&proof));
        let actions = nodes[0].handle(Event::MessageReceived {
            sender: ValidatorId(2),
            message: timeout,
        });
        assert!(matches!(
            actions.as_slice(),
            [Action::Send {
                to: ValidatorId(2),
                message: ConsensusMessage::ViewUpdate { epoch: EpochId(0), .. }
            }]
        ));

        let top = proof.high_qc().highest_qc.vertex_hash();
        let actions = nodes[0].handle(Event::MessageReceived {
            sender: ValidatorId(2),
            message: ConsensusMessage::SyncRequest {
                epoch: EpochId(0),
                vertex_hash: top,
                count: 2,
            },
        });
        match actions.as_slice() {
            [Action::Send {
                message: ConsensusMessage::SyncResponse { vertices, .. },
                ..
            }] => {
                assert_eq!(vertices.len(), 2);
                assert_eq!(vertices[0].hash(), top);
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_lagging_replica_catches_up_through_proof() {
        let mut nodes = managers(4, 3);
        let lagging = 3usize;
        // Replica 3 is down while the others finish epoch 0; they time out
        // past the views it leads.
        pump(&mut nodes, start_all(3), 5_000, |_, to, _| to == lagging);
        assert!(nodes[0].epoch() >= EpochId(1));
        assert_eq!(nodes[lagging].epoch(), EpochId(0));

        // Replica 3 comes back and times out in epoch 0.
        let log = pump(
            &mut nodes,
            vec![
                (lagging, Event::Start),
                (
                    lagging,
                    Event::LocalTimeout {
                        epoch: EpochId(0),
                        view: View(1),
                    },
                ),
            ],
            2_000,
            |_, _, _| false,
        );
        assert!(log.epoch_changes[lagging].contains(&EpochId(1)));
        assert!(nodes[lagging].epoch() >= EpochId(1));
    }

    /// Stale messages are answered without being verified.
    fn stale_vote(proof: &EpochProof) -> Vote {
        Vote {
            author: ValidatorId(2),
            vote_data: proof.high_qc().highest_qc.vote_data.clone(),
            timestamp_ms: 7,
            signature: Signature::zero(),
            high_qc: proof.high_qc().clone(),
            timeout_signature: Some(Signature::zero()),
        }
    }
}
