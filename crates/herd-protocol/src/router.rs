/// OverlayRouter — thin adapter between the overlay and the protocol.
///
/// Pure decision logic: raw topic bytes go in, a `RouterAction` comes out.
/// Fragments are reassembled per (sender, channel); complete payloads are
/// decoded according to their channel. Outbound payloads are fragmented
/// into wire frames. No I/O.
use bytes::Bytes;

use crate::chunk::ChunkCodec;
use crate::error::{ChunkError, HerdProtocolError, PostError};
use crate::post::Envelope;
use crate::sync::SyncCoordinator;
use crate::types::{Channel, PeerId};

// ── Routing decisions ──────────────────────────────────────────────────

/// A fully reassembled, decoded inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// A single freshly authored post.
    Post { from: PeerId, envelope: Envelope },
    /// The sender asks for our backlog.
    Catchup { from: PeerId },
    /// A backlog reply. Each entry is judged independently.
    Backlog {
        from: PeerId,
        entries: Vec<Result<Envelope, PostError>>,
    },
}

/// What to do with an inbound overlay message.
#[derive(Debug)]
pub enum RouterAction {
    /// Hand the decoded message to the protocol.
    Deliver(Inbound),
    /// The sender violated the fragment protocol and must be disconnected.
    DropPeer { peer: PeerId, reason: String },
    /// Not for us, or undecodable without proving misbehavior. Log only.
    Ignore { reason: String },
    /// Fragment buffered; the message is not complete yet.
    Pending,
}

// ── Router ─────────────────────────────────────────────────────────────

/// Owns the reassembly buffers of every remote sender.
#[derive(Debug)]
pub struct OverlayRouter {
    codec: ChunkCodec,
    sync: SyncCoordinator,
}

impl OverlayRouter {
    pub fn new(codec: ChunkCodec) -> Self {
        Self {
            codec,
            sync: SyncCoordinator::new(),
        }
    }

    /// Route raw bytes received on `topic` from `from`.
    pub fn route(&mut self, topic: &str, from: &PeerId, data: &[u8]) -> RouterAction {
        let channel: Channel = match topic.parse() {
            Ok(channel) => channel,
            Err(_) => {
                return RouterAction::Ignore {
                    reason: format!("unknown topic {topic:?}"),
                }
            }
        };

        let payload = match self.codec.ingest(from, channel, data) {
            Ok(Some(payload)) => payload,
            Ok(None) => return RouterAction::Pending,
            Err(e) => return drop_peer(from, channel, e),
        };

        match channel {
            Channel::Posts => match Envelope::from_json(&payload) {
                Ok(envelope) => RouterAction::Deliver(Inbound::Post {
                    from: from.clone(),
                    envelope,
                }),
                Err(e) => RouterAction::Ignore {
                    reason: format!("posts payload from {from}: {e}"),
                },
            },
            Channel::Catchup => RouterAction::Deliver(Inbound::Catchup { from: from.clone() }),
            Channel::Backlog => match self.sync.parse_backlog(&payload) {
                Ok(entries) => RouterAction::Deliver(Inbound::Backlog {
                    from: from.clone(),
                    entries,
                }),
                Err(e) => RouterAction::Ignore {
                    reason: format!("backlog payload from {from}: {e}"),
                },
            },
        }
    }

    /// Fragment an outbound payload into wire frames for `channel`.
    pub fn outbound(&self, channel: Channel, payload: &str) -> Result<Vec<Bytes>, HerdProtocolError> {
        let frames = self.codec.encode(payload)?;
        tracing::trace!(%channel, frames = frames.len(), "fragmented outbound payload");
        Ok(frames.into_iter().map(Bytes::from).collect())
    }

    /// Longest payload `outbound` accepts.
    pub fn max_payload_len(&self) -> usize {
        self.codec.max_payload_len()
    }

    /// Forget every partial message from a disconnected peer.
    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        self.codec.reset(peer);
    }

    /// Number of reassemblies in flight.
    pub fn in_flight(&self) -> usize {
        self.codec.in_flight()
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }
}

fn drop_peer(from: &PeerId, channel: Channel, error: ChunkError) -> RouterAction {
    RouterAction::DropPeer {
        peer: from.clone(),
        reason: format!("{channel}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPacket;
    use crate::identity::SeededKeyGenerator;
    use crate::post::PostCodec;
    use crate::store::MemoryPostStore;
    use chrono::Utc;

    fn router(fragment_size: usize) -> OverlayRouter {
        OverlayRouter::new(ChunkCodec::new(fragment_size).unwrap())
    }

    fn peer() -> PeerId {
        PeerId::new("12D3KooWsender")
    }

    fn envelope() -> Envelope {
        PostCodec::new(Box::new(SeededKeyGenerator::new(21)))
            .author(40.0, -74.0, "hello", Utc::now(), &MemoryPostStore::new())
            .unwrap()
            .envelope
    }

    fn deliver_all(router: &mut OverlayRouter, topic: &str, frames: &[Bytes]) -> RouterAction {
        let mut last = RouterAction::Pending;
        for frame in frames {
            last = router.route(topic, &peer(), frame);
        }
        last
    }

    #[test]
    fn post_roundtrips_through_fragments() {
        let sender = router(64);
        let mut receiver = router(64);
        let envelope = envelope();

        let frames = sender
            .outbound(Channel::Posts, &envelope.to_json().unwrap())
            .unwrap();
        assert!(frames.len() > 1);

        match deliver_all(&mut receiver, "posts", &frames) {
            RouterAction::Deliver(Inbound::Post { from, envelope: got }) => {
                assert_eq!(from, peer());
                assert_eq!(got, envelope);
            }
            other => panic!("expected post delivery, got {other:?}"),
        }
        assert_eq!(receiver.in_flight(), 0);
    }

    #[test]
    fn partial_message_is_pending() {
        let sender = router(16);
        let mut receiver = router(16);
        let frames = sender.outbound(Channel::Posts, "a payload longer than one fragment").unwrap();
        assert!(matches!(
            receiver.route("posts", &peer(), &frames[0]),
            RouterAction::Pending
        ));
        assert_eq!(receiver.in_flight(), 1);
    }

    #[test]
    fn catchup_probe_is_delivered() {
        let sender = router(400);
        let mut receiver = router(400);
        let frames = sender.outbound(Channel::Catchup, sender.sync().probe_payload()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            deliver_all(&mut receiver, "catchup", &frames),
            RouterAction::Deliver(Inbound::Catchup { .. })
        ));
    }

    #[test]
    fn backlog_entries_are_delivered() {
        let sender = router(400);
        let mut receiver = router(400);
        let entry = envelope().to_json().unwrap();
        let payload = serde_json::to_string(&vec![entry.clone(), entry]).unwrap();
        let frames = sender.outbound(Channel::Backlog, &payload).unwrap();

        match deliver_all(&mut receiver, "backlog", &frames) {
            RouterAction::Deliver(Inbound::Backlog { entries, .. }) => {
                assert_eq!(entries.len(), 2);
                assert!(entries.iter().all(Result::is_ok));
            }
            other => panic!("expected backlog delivery, got {other:?}"),
        }
    }

    #[test]
    fn malformed_fragment_drops_peer() {
        let mut receiver = router(400);
        let action = receiver.route("posts", &peer(), br#"{"index":0,"content":"x"}"#);
        assert!(matches!(action, RouterAction::DropPeer { peer: ref p, .. } if *p == peer()));
    }

    #[test]
    fn undecodable_post_is_ignored_not_dropped() {
        let mut receiver = router(400);
        let packet = ChunkPacket {
            index: 0,
            total: 1,
            content: "not an envelope".into(),
        };
        let action = receiver.route("posts", &peer(), &packet.to_bytes().unwrap());
        assert!(matches!(action, RouterAction::Ignore { .. }));
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let mut receiver = router(400);
        assert!(matches!(
            receiver.route("posts>", &peer(), b"{}"),
            RouterAction::Ignore { .. }
        ));
    }

    #[test]
    fn disconnect_clears_buffers() {
        let sender = router(16);
        let mut receiver = router(16);
        let frames = sender.outbound(Channel::Backlog, "[\"a much longer backlog body\"]").unwrap();
        receiver.route("backlog", &peer(), &frames[0]);
        assert_eq!(receiver.in_flight(), 1);
        receiver.peer_disconnected(&peer());
        assert_eq!(receiver.in_flight(), 0);
    }
}
