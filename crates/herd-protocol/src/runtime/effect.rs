use bytes::Bytes;

use crate::types::{Channel, PeerId};

use super::ProtocolEvent;

/// Intent produced by the pure logic of `RuntimeState`.
///
/// Every `handle_*` / `tick` method returns `Vec<RuntimeEffect>`; the event
/// loop then carries them out through the overlay and the event channel.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Publish wire frames, in order, on a channel.
    Publish { channel: Channel, frames: Vec<Bytes> },

    /// Disconnect a misbehaving peer.
    HangUp(PeerId),

    /// Dial a peer that just disconnected. One attempt only.
    Redial(PeerId),

    /// Run one discovery round against the bootstrap directories.
    Discover,

    /// Report peer and post counts to the application.
    ReportStatus { posts: usize },

    /// Emit a protocol event to the application.
    Emit(ProtocolEvent),
}
