//! Peer handles: channel-backed message streams.
//!
//! Each peer is an independent incoming stream plus an independent
//! outgoing queue. Processing one peer's stream never blocks another's;
//! a terminal signal on the incoming stream ends that peer's loop
//! cleanly and leaves every other peer untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::messages::PeerEvent;

/// How a peer relates to us, which drives who initiates sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// A server we load from and push everything to.
    Server,
    /// A client that loads from us.
    Client,
    /// A durable peer speaking the same protocol.
    Storage,
}

/// Opaque peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue depth for peer channels.
pub const PEER_CHANNEL_CAPACITY: usize = 256;

/// One side of a peer connection.
pub struct Peer {
    pub id: PeerId,
    pub role: PeerRole,
    /// Peers are synced in descending priority so dependencies reach
    /// storage and servers before casual clients.
    pub priority: u8,
    pub incoming: mpsc::Receiver<PeerEvent>,
    pub outgoing: mpsc::Sender<PeerEvent>,
}

impl Peer {
    /// Default priority for a role.
    pub fn default_priority(role: PeerRole) -> u8 {
        match role {
            PeerRole::Storage => 200,
            PeerRole::Server => 100,
            PeerRole::Client => 10,
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Build two connected peer handles with crossed channels.
///
/// What one side sends on `outgoing` arrives on the other side's
/// `incoming`. The first handle sees the second as `role_b` and vice
/// versa.
pub fn connected_peer_pair(
    id_a: PeerId,
    role_a: PeerRole,
    id_b: PeerId,
    role_b: PeerRole,
) -> (Peer, Peer) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);

    let a_sees_b = Peer {
        id: id_b,
        role: role_b,
        priority: Peer::default_priority(role_b),
        incoming: b_to_a_rx,
        outgoing: a_to_b_tx,
    };
    let b_sees_a = Peer {
        id: id_a,
        role: role_a,
        priority: Peer::default_priority(role_a),
        incoming: a_to_b_rx,
        outgoing: b_to_a_tx,
    };
    (a_sees_b, b_sees_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PeerSignal, SyncMessage};
    use weft_core::{CoId, KnownState};

    #[tokio::test]
    async fn test_crossed_channels() {
        let (mut node_a, mut node_b) = connected_peer_pair(
            PeerId::new("a"),
            PeerRole::Client,
            PeerId::new("b"),
            PeerRole::Server,
        );

        let msg = SyncMessage::Load(KnownState::empty(CoId::from_bytes([1; 32])));
        node_a.outgoing.send(msg.clone().into()).await.unwrap();

        let received = node_b.incoming.recv().await.unwrap();
        assert_eq!(received, PeerEvent::Message(msg));

        node_b
            .outgoing
            .send(PeerEvent::Signal(PeerSignal::Disconnected))
            .await
            .unwrap();
        let received = node_a.incoming.recv().await.unwrap();
        assert_eq!(received, PeerEvent::Signal(PeerSignal::Disconnected));
    }

    #[test]
    fn test_default_priorities_rank_storage_first() {
        assert!(
            Peer::default_priority(PeerRole::Storage) > Peer::default_priority(PeerRole::Server)
        );
        assert!(
            Peer::default_priority(PeerRole::Server) > Peer::default_priority(PeerRole::Client)
        );
    }
}
