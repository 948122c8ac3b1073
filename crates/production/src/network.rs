//! Message transport for the production runner.
//!
//! The runner only needs fire-and-forget delivery: consensus tolerates loss,
//! duplication and reordering. [`Transport`] is the seam a real network
//! implements; [`ChannelNetwork`] connects runners inside one process over
//! bounded tokio channels.

use concord_core::ConsensusMessage;
use concord_types::ValidatorId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// A message received from a peer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: ValidatorId,
    pub message: ConsensusMessage,
}

/// Errors from sending a message.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(ValidatorId),
    #[error("peer {0} is unreachable")]
    Unreachable(ValidatorId),
}

/// Outbound side of the network.
///
/// Both methods must not block; delivery is best effort.
pub trait Transport: Send + Sync {
    /// Send `message` to one peer.
    fn send(&self, to: ValidatorId, message: ConsensusMessage) -> Result<(), TransportError>;

    /// Send `message` to every peer except the local node.
    fn broadcast(&self, message: ConsensusMessage);
}

#[derive(Debug, Default)]
struct Hub {
    inboxes: HashMap<ValidatorId, mpsc::Sender<InboundMessage>>,
    disconnected: HashSet<ValidatorId>,
}

/// In-process network connecting any number of runners.
#[derive(Debug, Clone, Default)]
pub struct ChannelNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return its inbound channel and outbound transport.
    pub fn join(
        &self,
        id: ValidatorId,
        capacity: usize,
    ) -> (ChannelTransport, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.hub.lock().inboxes.insert(id, tx);
        let transport = ChannelTransport {
            local: id,
            network: self.clone(),
        };
        (transport, rx)
    }

    /// Cut `id` off from everyone, in both directions.
    pub fn disconnect(&self, id: ValidatorId) {
        self.hub.lock().disconnected.insert(id);
    }

    pub fn reconnect(&self, id: ValidatorId) {
        self.hub.lock().disconnected.remove(&id);
    }

    fn deliver(
        &self,
        from: ValidatorId,
        to: ValidatorId,
        message: ConsensusMessage,
    ) -> Result<(), TransportError> {
        let hub = self.hub.lock();
        if hub.disconnected.contains(&from) || hub.disconnected.contains(&to) {
            return Err(TransportError::Unreachable(to));
        }
        let inbox = hub.inboxes.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        inbox
            .try_send(InboundMessage {
                sender: from,
                message,
            })
            .map_err(|_| TransportError::Unreachable(to))
    }
}

/// One node's handle on a [`ChannelNetwork`].
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    local: ValidatorId,
    network: ChannelNetwork,
}

impl Transport for ChannelTransport {
    fn send(&self, to: ValidatorId, message: ConsensusMessage) -> Result<(), TransportError> {
        self.network.deliver(self.local, to, message)
    }

    fn broadcast(&self, message: ConsensusMessage) {
        let peers: Vec<ValidatorId> = self
            .network
            .hub
            .lock()
            .inboxes
            .keys()
            .copied()
            .filter(|id| *id != self.local)
            .collect();
        for peer in peers {
            if let Err(e) = self.network.deliver(self.local, peer, message.clone()) {
                trace!(from = %self.local, error = %e, "Broadcast copy dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::test_utils::genesis_qc;
    use concord_types::{EpochId, HighQc, View};

    fn view_update(view: u64) -> ConsensusMessage {
        ConsensusMessage::ViewUpdate {
            epoch: EpochId(0),
            view: View(view),
            high_qc: HighQc::from_genesis(genesis_qc(EpochId(0))),
        }
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let network = ChannelNetwork::new();
        let (a, mut a_rx) = network.join(ValidatorId(0), 8);
        let (_b, mut b_rx) = network.join(ValidatorId(1), 8);
        let (_c, mut c_rx) = network.join(ValidatorId(2), 8);

        a.send(ValidatorId(1), view_update(1)).unwrap();
        let received = b_rx.recv().await.unwrap();
        assert_eq!(received.sender, ValidatorId(0));
        assert_eq!(received.message, view_update(1));

        a.broadcast(view_update(2));
        assert_eq!(b_rx.recv().await.unwrap().message, view_update(2));
        assert_eq!(c_rx.recv().await.unwrap().message, view_update(2));
        // Never to self.
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_and_disconnected_peers() {
        let network = ChannelNetwork::new();
        let (a, _a_rx) = network.join(ValidatorId(0), 8);
        let (_b, mut b_rx) = network.join(ValidatorId(1), 8);

        assert!(matches!(
            a.send(ValidatorId(9), view_update(1)),
            Err(TransportError::UnknownPeer(_))
        ));

        network.disconnect(ValidatorId(1));
        assert!(matches!(
            a.send(ValidatorId(1), view_update(1)),
            Err(TransportError::Unreachable(_))
        ));
        network.reconnect(ValidatorId(1));
        a.send(ValidatorId(1), view_update(2)).unwrap();
        assert_eq!(b_rx.recv().await.unwrap().message, view_update(2));
    }

    #[tokio::test]
    async fn test_full_inbox_drops() {
        let network = ChannelNetwork::new();
        let (a, _a_rx) = network.join(ValidatorId(0), 8);
        let (_b, _b_rx) = network.join(ValidatorId(1), 1);

        a.send(ValidatorId(1), view_update(1)).unwrap();
        assert!(a.send(ValidatorId(1), view_update(2)).is_err());
    }
}
