use bytes::Bytes;

use crate::error::OverlayError;
use crate::types::{Channel, PeerId};

/// Abstract peer-to-peer substrate the runtime publishes through.
///
/// In production: a libp2p-style pub/sub node.
/// In tests and simulations: `MemoryOverlay`, an in-process hub.
///
/// Inbound traffic does not flow through this trait: the overlay pushes
/// `OverlayEvent`s into the runtime's event queue.
#[async_trait::async_trait]
pub trait Overlay: Send + Sync {
    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: Channel) -> Result<(), OverlayError>;

    /// Broadcast one wire frame on `channel`.
    async fn publish(&self, channel: Channel, data: Bytes) -> Result<(), OverlayError>;

    /// Dial a multiaddr obtained from a directory.
    async fn dial_addr(&self, addr: &str) -> Result<(), OverlayError>;

    /// Dial a previously known peer.
    async fn dial_peer(&self, peer: &PeerId) -> Result<(), OverlayError>;

    /// Sever the connection to a peer.
    async fn hang_up(&self, peer: &PeerId) -> Result<(), OverlayError>;

    /// Number of currently connected peers.
    async fn peer_count(&self) -> usize;
}

/// Events the overlay delivers to the runtime, in arrival order.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// A frame arrived on a subscribed topic.
    MessageReceived {
        topic: String,
        from: PeerId,
        data: Bytes,
    },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
}
