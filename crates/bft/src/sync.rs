//! Fetching missing ancestors.
//!
//! When a certificate names a vertex this replica does not hold, the event
//! that carried it is parked and a `SyncRequest` goes to the sender. If no
//! response arrives within the request timeout the request is re-sent to the
//! next validator that signed the certificate. Once the vertex is inserted,
//! or the committed root moves past its view, the parked events are replayed
//! as internal events.

use concord_core::{Action, ConsensusMessage, Event, TimerId};
use concord_types::{EpochId, Hash, ValidatorId, View};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// A vertex named by a certificate but absent from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingVertex {
    pub hash: Hash,
    pub view: View,
}

#[derive(Debug)]
struct InFlight {
    view: View,
    /// Peers to ask, in order. The first is the original sender.
    candidates: Vec<ValidatorId>,
    attempt: usize,
    count: usize,
}

/// Outstanding sync requests and the events waiting on them.
#[derive(Debug)]
pub struct VertexSync {
    epoch: EpochId,
    self_id: ValidatorId,
    request_timeout: Duration,
    max_deferred: usize,
    in_flight: BTreeMap<Hash, InFlight>,
    deferred: VecDeque<(MissingVertex, Event)>,
}

impl VertexSync {
    pub fn new(
        epoch: EpochId,
        self_id: ValidatorId,
        request_timeout: Duration,
        max_deferred: usize,
    ) -> Self {
        Self {
            epoch,
            self_id,
            request_timeout,
            max_deferred,
            in_flight: BTreeMap::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn is_in_flight(&self, hash: &Hash) -> bool {
        self.in_flight.contains_key(hash)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn timer(&self, vertex_hash: Hash) -> TimerId {
        TimerId::SyncRetry {
            epoch: self.epoch,
            vertex_hash,
        }
    }

    /// Ask for the missing vertex and its ancestors. Returns no actions if a
    /// request for the same hash is already outstanding.
    pub fn request(
        &mut self,
        missing: MissingVertex,
        from: ValidatorId,
        signers: impl IntoIterator<Item = ValidatorId>,
        count: usize,
    ) -> Vec<Action> {
        let hash = missing.hash;
        if self.in_flight.contains_key(&hash) {
            return vec![];
        }
        let mut candidates = vec![];
        for peer in std::iter::once(from).chain(signers) {
            if peer != self.self_id && !candidates.contains(&peer) {
                candidates.push(peer);
            }
        }
        let Some(first) = candidates.first().copied() else {
            return vec![];
        };

        debug!(vertex = %hash, peer = %first, count = count, "Requesting missing vertices");
        self.in_flight.insert(
            hash,
            InFlight {
                view: missing.view,
                candidates,
                attempt: 0,
                count,
            },
        );
        vec![
            Action::Send {
                to: first,
                message: ConsensusMessage::SyncRequest {
                    epoch: self.epoch,
                    vertex_hash: hash,
                    count,
                },
            },
            Action::SetTimer {
                id: self.timer(hash),
                duration: self.request_timeout,
            },
        ]
    }

    /// Park `event` until the vertex is resolved. Returns true if an older
    /// parked event had to be dropped to make room.
    pub fn defer(&mut self, missing: MissingVertex, event: Event) -> bool {
        self.deferred.push_back((missing, event));
        if self.deferred.len() > self.max_deferred {
            if let Some((dropped, _)) = self.deferred.pop_front() {
                warn!(vertex = %dropped.hash, "Deferred event queue full, dropping oldest");
            }
            return true;
        }
        false
    }

    /// The request for `hash` timed out: ask the next candidate.
    pub fn on_timeout(&mut self, hash: Hash) -> Vec<Action> {
        let timer = self.timer(hash);
        let Some(entry) = self.in_flight.get_mut(&hash) else {
            return vec![];
        };
        entry.attempt += 1;
        let peer = entry.candidates[entry.attempt % entry.candidates.len()];
        debug!(
            vertex = %hash,
            peer = %peer,
            attempt = entry.attempt,
            "Retrying sync request"
        );
        vec![
            Action::Send {
                to: peer,
                message: ConsensusMessage::SyncRequest {
                    epoch: self.epoch,
                    vertex_hash: hash,
                    count: entry.count,
                },
            },
            Action::SetTimer {
                id: timer,
                duration: self.request_timeout,
            },
        ]
    }

    /// Resolve every request and parked event for which `resolved` holds:
    /// the vertex is present, or no longer needed.
    pub fn resolve(&mut self, resolved: impl Fn(&MissingVertex) -> bool) -> Vec<Action> {
        let mut actions = vec![];
        let done: Vec<Hash> = self
            .in_flight
            .iter()
            .filter(|(hash, entry)| {
                resolved(&MissingVertex {
                    hash: **hash,
                    view: entry.view,
                })
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in done {
            self.in_flight.remove(&hash);
            actions.push(Action::CancelTimer {
                id: self.timer(hash),
            });
        }

        let mut still_waiting = VecDeque::with_capacity(self.deferred.len());
        for (missing, event) in self.deferred.drain(..) {
            if resolved(&missing) {
                actions.push(Action::EnqueueInternal { event });
            } else {
                still_waiting.push_back((missing, event));
            }
        }
        self.deferred = still_waiting;
        actions
    }

    /// Cancel all outstanding requests.
    pub fn stop(&mut self) -> Vec<Action> {
        let timers: Vec<TimerId> = self.in_flight.keys().map(|h| self.timer(*h)).collect();
        self.in_flight.clear();
        self.deferred.clear();
        timers
            .into_iter()
            .map(|id| Action::CancelTimer { id })
            .collect()
    }
}
