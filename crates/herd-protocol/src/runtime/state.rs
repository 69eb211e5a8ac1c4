use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::chunk::ChunkCodec;
use crate::error::{HerdProtocolError, PostError};
use crate::identity::KeyGenerator;
use crate::location;
use crate::post::{Envelope, Post, PostCodec, Verdict};
use crate::ranking::{RankedPost, RankingEngine};
use crate::router::{Inbound, OverlayRouter, RouterAction};
use crate::store::PostStore;
use crate::sync::DisconnectAction;
use crate::types::{Channel, PeerId};

use super::effect::RuntimeEffect;
use super::overlay::OverlayEvent;
use super::scheduler::TaskKind;
use super::{ProtocolEvent, RuntimeConfig};

/// All protocol state, with pure handlers.
///
/// No I/O happens here: every handler returns the effects the event loop
/// must carry out. Store access is synchronous and atomic per post.
pub struct RuntimeState {
    config: RuntimeConfig,
    router: OverlayRouter,
    posts: PostCodec,
    ranking: RankingEngine,
    store: Arc<dyn PostStore>,
}

impl RuntimeState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn PostStore>,
        keys: Box<dyn KeyGenerator>,
    ) -> Result<Self, HerdProtocolError> {
        let codec = ChunkCodec::new(config.fragment_size)?.with_max_fragments(config.max_fragments);
        Ok(Self {
            router: OverlayRouter::new(codec),
            posts: PostCodec::new(keys),
            ranking: RankingEngine::new(config.ranking),
            store,
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ── Timers ─────────────────────────────────────────────────────────

    /// Effects of one scheduled task firing.
    pub fn tick(&mut self, task: TaskKind) -> Vec<RuntimeEffect> {
        match task {
            TaskKind::CatchupProbe => {
                let probe = self.router.sync().probe_payload();
                match self.router.outbound(Channel::Catchup, probe) {
                    Ok(frames) => vec![
                        RuntimeEffect::Publish {
                            channel: Channel::Catchup,
                            frames,
                        },
                        RuntimeEffect::Emit(ProtocolEvent::CatchupSent),
                    ],
                    Err(e) => vec![error_effect(format!("catchup probe: {e}"))],
                }
            }
            TaskKind::Discovery => {
                if self.config.bootstrap_servers.is_empty() {
                    Vec::new()
                } else {
                    vec![RuntimeEffect::Discover]
                }
            }
            TaskKind::StatusRefresh => match self.store.count() {
                Ok(posts) => vec![RuntimeEffect::ReportStatus { posts }],
                Err(e) => vec![error_effect(format!("status: {e}"))],
            },
        }
    }

    // ── Overlay events ─────────────────────────────────────────────────

    pub fn handle_overlay_event(&mut self, event: OverlayEvent, now: DateTime<Utc>) -> Vec<RuntimeEffect> {
        match event {
            OverlayEvent::MessageReceived { topic, from, data } => {
                self.handle_message(&topic, &from, &data, now)
            }
            OverlayEvent::PeerConnected { peer } => {
                tracing::debug!(%peer, "peer connected");
                Vec::new()
            }
            OverlayEvent::PeerDisconnected { peer } => {
                tracing::debug!(%peer, "peer disconnected");
                self.router.peer_disconnected(&peer);
                match self.router.sync().on_disconnect(&peer) {
                    DisconnectAction::Redial(peer) => vec![RuntimeEffect::Redial(peer)],
                }
            }
        }
    }

    fn handle_message(
        &mut self,
        topic: &str,
        from: &PeerId,
        data: &[u8],
        now: DateTime<Utc>,
    ) -> Vec<RuntimeEffect> {
        match self.router.route(topic, from, data) {
            RouterAction::Pending => Vec::new(),
            RouterAction::Ignore { reason } => {
                tracing::debug!(%from, %reason, "ignored message");
                Vec::new()
            }
            RouterAction::DropPeer { peer, reason } => self.drop_peer(peer, reason),
            RouterAction::Deliver(Inbound::Post { from, envelope }) => {
                let mut effects = Vec::new();
                self.import(&from, Channel::Posts, &envelope, now, &mut effects);
                effects
            }
            RouterAction::Deliver(Inbound::Catchup { from }) => self.serve_backlog(from),
            RouterAction::Deliver(Inbound::Backlog { from, entries }) => {
                let mut effects = Vec::new();
                for entry in entries {
                    let envelope = match entry {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::debug!(%from, error = %e, "skipping undecodable backlog entry");
                            continue;
                        }
                    };
                    if !self.import(&from, Channel::Backlog, &envelope, now, &mut effects) {
                        break;
                    }
                }
                effects
            }
        }
    }

    /// Verify and store one envelope. Returns `false` if the sender was
    /// dropped and the rest of its message should be discarded.
    fn import(
        &mut self,
        from: &PeerId,
        channel: Channel,
        envelope: &Envelope,
        now: DateTime<Utc>,
        effects: &mut Vec<RuntimeEffect>,
    ) -> bool {
        match self.posts.verify(envelope, now, self.store.as_ref()) {
            Ok(Verdict::Accepted(post)) => {
                tracing::info!(id = %post.id, %from, %channel, "accepted post");
                effects.push(RuntimeEffect::Emit(ProtocolEvent::PostAccepted {
                    id: post.id,
                    from: from.clone(),
                    channel,
                }));
                true
            }
            Ok(Verdict::Duplicate { id }) => {
                tracing::debug!(%id, %from, "duplicate post");
                true
            }
            Err(e) if e.is_peer_fault() => {
                effects.push(RuntimeEffect::Emit(ProtocolEvent::PostRejected {
                    from: from.clone(),
                    reason: e.to_string(),
                }));
                effects.extend(self.drop_peer(from.clone(), e.to_string()));
                false
            }
            Err(PostError::Store(e)) => {
                effects.push(error_effect(format!("store post from {from}: {e}")));
                true
            }
            Err(e) => {
                tracing::debug!(%from, error = %e, "discarded post");
                true
            }
        }
    }

    fn serve_backlog(&mut self, to: PeerId) -> Vec<RuntimeEffect> {
        let max_len = self.router.max_payload_len();
        let replies = match self.router.sync().backlog_replies(self.store.as_ref(), max_len) {
            Ok(replies) if replies.is_empty() => return Vec::new(),
            Ok(replies) => replies,
            Err(e) => return vec![error_effect(format!("backlog for {to}: {e}"))],
        };

        let mut effects = Vec::with_capacity(replies.len() + 1);
        let mut posts = 0;
        for reply in &replies {
            match self.router.outbound(Channel::Backlog, &reply.payload) {
                Ok(frames) => {
                    posts += reply.posts;
                    effects.push(RuntimeEffect::Publish {
                        channel: Channel::Backlog,
                        frames,
                    });
                }
                Err(e) => effects.push(error_effect(format!("backlog for {to}: {e}"))),
            }
        }
        tracing::info!(%to, posts, messages = replies.len(), "serving backlog");
        effects.push(RuntimeEffect::Emit(ProtocolEvent::BacklogServed { to, posts }));
        effects
    }

    fn drop_peer(&mut self, peer: PeerId, reason: String) -> Vec<RuntimeEffect> {
        tracing::warn!(%peer, %reason, "dropping misbehaving peer");
        self.router.peer_disconnected(&peer);
        vec![
            RuntimeEffect::HangUp(peer.clone()),
            RuntimeEffect::Emit(ProtocolEvent::PeerDropped { peer, reason }),
        ]
    }

    // ── Commands ───────────────────────────────────────────────────────

    /// Skew the position, author a post and fragment it onto `posts`.
    pub fn publish_post(
        &mut self,
        latitude: f64,
        longitude: f64,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(Post, Vec<RuntimeEffect>), HerdProtocolError> {
        let position = location::skew_location(latitude, longitude, &self.config.skew);
        let authored = self.posts.author(
            position.latitude,
            position.longitude,
            text,
            now,
            self.store.as_ref(),
        )?;
        let frames = self
            .router
            .outbound(Channel::Posts, &authored.envelope.to_json()?)?;
        tracing::info!(id = %authored.post.id, frames = frames.len(), "publishing post");

        let effects = vec![
            RuntimeEffect::Publish {
                channel: Channel::Posts,
                frames,
            },
            RuntimeEffect::Emit(ProtocolEvent::PostPublished {
                id: authored.post.id.clone(),
            }),
        ];
        Ok((authored.post, effects))
    }

    pub fn ranked_posts(
        &self,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedPost>, HerdProtocolError> {
        let posts = self.store.get_many()?;
        Ok(self.ranking.rank_at(posts, latitude, longitude, now))
    }

    pub fn posts(&self) -> Result<Vec<Post>, HerdProtocolError> {
        Ok(self.store.get_many()?)
    }
}

fn error_effect(description: String) -> RuntimeEffect {
    tracing::warn!(%description, "runtime error");
    RuntimeEffect::Emit(ProtocolEvent::Error { description })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkPacket;
    use crate::identity::SeededKeyGenerator;
    use crate::store::MemoryPostStore;
    use bytes::Bytes;

    fn state(seed: u64) -> (RuntimeState, Arc<MemoryPostStore>) {
        state_with(seed, RuntimeConfig::new())
    }

    fn state_with(seed: u64, config: RuntimeConfig) -> (RuntimeState, Arc<MemoryPostStore>) {
        let store = Arc::new(MemoryPostStore::new());
        let state = RuntimeState::new(
            config.bootstrap_servers(Vec::new()),
            store.clone(),
            Box::new(SeededKeyGenerator::new(seed)),
        )
        .unwrap();
        (state, store)
    }

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    /// Turn a `Publish` effect into the events a remote node would see.
    fn as_received(effect: &RuntimeEffect, from: &PeerId) -> Vec<OverlayEvent> {
        match effect {
            RuntimeEffect::Publish { channel, frames } => frames
                .iter()
                .map(|data| OverlayEvent::MessageReceived {
                    topic: channel.as_str().to_string(),
                    from: from.clone(),
                    data: data.clone(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn deliver(state: &mut RuntimeState, events: Vec<OverlayEvent>) -> Vec<RuntimeEffect> {
        events
            .into_iter()
            .flat_map(|e| state.handle_overlay_event(e, Utc::now()))
            .collect()
    }

    fn emitted(effects: &[RuntimeEffect]) -> Vec<&ProtocolEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                RuntimeEffect::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn publish_stores_skewed_post_and_fragments_it() {
        let (mut author, store) = state(1);
        let (post, effects) = author.publish_post(40.0, -74.0, "hello", Utc::now()).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let (lat, lon) = post.coordinates().unwrap();
        let moved_km = crate::geo::distance_m(40.0, -74.0, lat, lon) / 1000.0;
        assert!((1.9..=2.8).contains(&moved_km), "moved {moved_km} km");
        assert!(matches!(
            &effects[0],
            RuntimeEffect::Publish { channel: Channel::Posts, frames } if !frames.is_empty()
        ));
        assert_eq!(
            emitted(&effects),
            vec![&ProtocolEvent::PostPublished { id: post.id.clone() }]
        );
    }

    #[test]
    fn published_post_is_accepted_by_a_peer() {
        let (mut author, _) = state(1);
        let (mut reader, reader_store) = state(2);
        let (post, effects) = author.publish_post(40.0, -74.0, "hello", Utc::now()).unwrap();

        let out = deliver(&mut reader, as_received(&effects[0], &peer("author")));
        assert_eq!(
            emitted(&out),
            vec![&ProtocolEvent::PostAccepted {
                id: post.id.clone(),
                from: peer("author"),
                channel: Channel::Posts,
            }]
        );
        let stored = reader_store.get_many().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].raw, post.raw);
        assert!(!stored[0].is_local());

        // Replayed frames are a silent no-op.
        assert!(deliver(&mut reader, as_received(&effects[0], &peer("author"))).is_empty());
        assert_eq!(reader_store.count().unwrap(), 1);
    }

    #[test]
    fn catchup_probe_is_answered_with_backlog() {
        let (mut holder, _) = state(3);
        for text in ["one", "two", "three"] {
            holder.publish_post(40.0, -74.0, text, Utc::now()).unwrap();
        }
        let (mut newcomer, newcomer_store) = state(4);

        let probe = newcomer.tick(TaskKind::CatchupProbe);
        assert!(emitted(&probe).contains(&&ProtocolEvent::CatchupSent));

        let reply = deliver(&mut holder, as_received(&probe[0], &peer("newcomer")));
        assert!(emitted(&reply).contains(&&ProtocolEvent::BacklogServed {
            to: peer("newcomer"),
            posts: 3,
        }));

        let imported = deliver(&mut newcomer, as_received(&reply[0], &peer("holder")));
        assert_eq!(emitted(&imported).len(), 3);
        assert_eq!(newcomer_store.count().unwrap(), 3);
    }

    #[test]
    fn backlog_beyond_fragment_limit_is_split_and_imported() {
        let config = || RuntimeConfig::new().fragment_size(64).max_fragments(64);
        let (mut holder, _) = state_with(13, config());
        for i in 0..20 {
            holder.publish_post(40.0, -74.0, &format!("post {i}"), Utc::now()).unwrap();
        }
        let (mut newcomer, newcomer_store) = state_with(14, config());

        // The whole store would not fit in one message.
        let whole = holder.router.sync().backlog_replies(holder.store.as_ref(), usize::MAX).unwrap();
        assert!(holder.router.outbound(Channel::Backlog, &whole[0].payload).is_err());

        let probe = newcomer.tick(TaskKind::CatchupProbe);
        let reply = deliver(&mut holder, as_received(&probe[0], &peer("newcomer")));
        let publishes: Vec<&RuntimeEffect> = reply
            .iter()
            .filter(|e| matches!(e, RuntimeEffect::Publish { .. }))
            .collect();
        assert!(publishes.len() > 1);
        for effect in &publishes {
            if let RuntimeEffect::Publish { channel, frames } = effect {
                assert_eq!(*channel, Channel::Backlog);
                assert!(frames.len() <= 64);
            }
        }
        assert!(emitted(&reply).contains(&&ProtocolEvent::BacklogServed {
            to: peer("newcomer"),
            posts: 20,
        }));

        let events: Vec<OverlayEvent> = publishes
            .into_iter()
            .flat_map(|effect| as_received(effect, &peer("holder")))
            .collect();
        let imported = deliver(&mut newcomer, events);
        assert!(!imported.iter().any(|e| matches!(e, RuntimeEffect::HangUp(_))));
        assert_eq!(newcomer_store.count().unwrap(), 20);
    }

    #[test]
    fn empty_store_does_not_answer_probe() {
        let (mut prober, _) = state(5);
        let (mut empty, _) = state(6);
        let probe = prober.tick(TaskKind::CatchupProbe);
        assert!(deliver(&mut empty, as_received(&probe[0], &peer("prober"))).is_empty());
    }

    #[test]
    fn tampered_post_drops_sender() {
        let (mut author, _) = state(7);
        let (mut reader, reader_store) = state(8);
        let (_, effects) = author.publish_post(1.0, 1.0, "genuine", Utc::now()).unwrap();

        // Reassemble, alter the text inside the signed payload, re-fragment.
        let mut frames = Vec::new();
        if let RuntimeEffect::Publish { frames: f, .. } = &effects[0] {
            frames = f.clone();
        }
        let json: String = frames
            .iter()
            .map(|f| ChunkPacket::parse(f).unwrap().content)
            .collect();
        let tampered = json.replace("genuine", "forged!");
        let packet = ChunkPacket {
            index: 0,
            total: 1,
            content: tampered,
        };
        let event = OverlayEvent::MessageReceived {
            topic: "posts".into(),
            from: peer("liar"),
            data: Bytes::from(packet.to_bytes().unwrap()),
        };

        let out = reader.handle_overlay_event(event, Utc::now());
        assert!(out.iter().any(|e| matches!(e, RuntimeEffect::HangUp(p) if *p == peer("liar"))));
        assert!(emitted(&out)
            .iter()
            .any(|e| matches!(e, ProtocolEvent::PeerDropped { .. })));
        assert_eq!(reader_store.count().unwrap(), 0);
    }

    #[test]
    fn malformed_fragment_drops_sender() {
        let (mut reader, _) = state(9);
        let event = OverlayEvent::MessageReceived {
            topic: "backlog".into(),
            from: peer("noisy"),
            data: Bytes::from_static(br#"{"index":-1,"total":1,"content":"x"}"#),
        };
        let out = reader.handle_overlay_event(event, Utc::now());
        assert!(matches!(&out[0], RuntimeEffect::HangUp(p) if *p == peer("noisy")));
    }

    #[test]
    fn disconnect_triggers_single_redial() {
        let (mut node, _) = state(10);
        let out = node.handle_overlay_event(
            OverlayEvent::PeerDisconnected { peer: peer("gone") },
            Utc::now(),
        );
        assert!(matches!(&out[..], [RuntimeEffect::Redial(p)] if *p == peer("gone")));
    }

    #[test]
    fn status_and_discovery_ticks() {
        let (mut node, _) = state(11);
        node.publish_post(0.0, 0.0, "x", Utc::now()).unwrap();
        assert!(matches!(
            &node.tick(TaskKind::StatusRefresh)[..],
            [RuntimeEffect::ReportStatus { posts: 1 }]
        ));
        // No bootstrap servers configured: nothing to discover.
        assert!(node.tick(TaskKind::Discovery).is_empty());
    }

    #[test]
    fn ranked_posts_prefer_nearby() {
        let (mut node, _) = state(12);
        node.publish_post(48.85, 2.35, "paris", Utc::now()).unwrap();
        node.publish_post(40.71, -74.0, "new york", Utc::now()).unwrap();
        let ranked = node.ranked_posts(40.71, -74.0, Utc::now()).unwrap();
        assert_eq!(ranked[0].post.text, "new york");
        assert!(ranked[1].distance_km() > 5000.0);
    }
}
