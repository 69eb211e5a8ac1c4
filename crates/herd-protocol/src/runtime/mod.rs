/// Protocol runtime — integrates all protocol modules into a live event loop.
///
/// The runtime owns the overlay handle, the post store and all protocol
/// state (router, post codec, ranking). It exposes a channel-based API so
/// the application never touches fragments, envelopes or signatures.
mod effect;
mod executor;
mod r#loop;
mod memory;
mod overlay;
mod scheduler;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::chunk::{DEFAULT_FRAGMENT_SIZE, DEFAULT_MAX_FRAGMENTS};
use crate::discovery::Directory;
use crate::error::HerdProtocolError;
use crate::identity::KeyGenerator;
use crate::location::SkewConfig;
use crate::post::Post;
use crate::ranking::{RankedPost, RankingConfig};
use crate::store::PostStore;
use crate::types::{Channel, PeerId};

pub use effect::RuntimeEffect;
pub use memory::{MemoryHub, MemoryOverlay};
pub use overlay::{Overlay, OverlayEvent};
pub use scheduler::{Scheduler, TaskKind};
pub use state::RuntimeState;

/// Environment variable holding comma-separated bootstrap directory URLs.
pub const BOOTSTRAP_SERVERS_ENV: &str = "HERD_BOOTSTRAP_SERVERS";

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the protocol runtime.
///
/// ```rust
/// use std::time::Duration;
/// use herd_protocol::RuntimeConfig;
///
/// let config = RuntimeConfig::new()
///     .catchup_interval(Duration::from_secs(10))
///     .fragment_size(256);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval between catch-up probes.
    pub catchup_interval: Duration,
    /// Interval between discovery rounds.
    pub discovery_interval: Duration,
    /// Interval between status reports.
    pub status_interval: Duration,
    /// Maximum bytes of content per wire fragment.
    pub fragment_size: usize,
    /// Largest fragment count accepted from a peer.
    pub max_fragments: u32,
    /// Directory servers queried on every discovery round.
    pub bootstrap_servers: Vec<String>,
    pub ranking: RankingConfig,
    pub skew: SkewConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Create a config with defaults.
    ///
    /// Bootstrap servers are read from `HERD_BOOTSTRAP_SERVERS` if set.
    pub fn new() -> Self {
        let bootstrap_servers = std::env::var(BOOTSTRAP_SERVERS_ENV)
            .map(|v| parse_server_list(&v))
            .unwrap_or_default();

        Self {
            catchup_interval: Duration::from_secs(5),
            discovery_interval: Duration::from_secs(30),
            status_interval: Duration::from_secs(1),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            max_fragments: DEFAULT_MAX_FRAGMENTS,
            bootstrap_servers,
            ranking: RankingConfig::default(),
            skew: SkewConfig::default(),
        }
    }

    /// Set the catch-up probe interval (default: 5 s).
    pub fn catchup_interval(mut self, interval: Duration) -> Self {
        self.catchup_interval = interval;
        self
    }

    /// Set the discovery interval (default: 30 s).
    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Set the status report interval (default: 1 s).
    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Set the wire fragment size (default: 400).
    pub fn fragment_size(mut self, bytes: usize) -> Self {
        self.fragment_size = bytes;
        self
    }

    pub fn max_fragments(mut self, max: u32) -> Self {
        self.max_fragments = max;
        self
    }

    /// Replace the bootstrap directory list.
    pub fn bootstrap_servers(mut self, servers: Vec<String>) -> Self {
        self.bootstrap_servers = servers;
        self
    }

    pub fn ranking(mut self, ranking: RankingConfig) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn skew(mut self, skew: SkewConfig) -> Self {
        self.skew = skew;
        self
    }
}

/// Split a comma-separated server list, dropping blanks.
pub fn parse_server_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the runtime event loop.
pub enum RuntimeCommand {
    /// Skew the position, author a post, store and publish it.
    PublishPost {
        latitude: f64,
        longitude: f64,
        text: String,
        reply: oneshot::Sender<Result<Post, HerdProtocolError>>,
    },
    /// Query: every stored post ranked against a position.
    RankedPosts {
        latitude: f64,
        longitude: f64,
        reply: oneshot::Sender<Result<Vec<RankedPost>, HerdProtocolError>>,
    },
    /// Query: every stored post in insertion order.
    Posts {
        reply: oneshot::Sender<Result<Vec<Post>, HerdProtocolError>>,
    },
    /// Query: number of connected peers.
    PeerCount { reply: oneshot::Sender<usize> },
    /// Stop all scheduled tasks and end the loop.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Protocol-level events the application may want to observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// A remote post was verified and stored.
    PostAccepted {
        id: String,
        from: PeerId,
        channel: Channel,
    },
    /// A locally authored post was published.
    PostPublished { id: String },
    /// A remote post failed verification.
    PostRejected { from: PeerId, reason: String },
    /// A peer was disconnected for misbehaving.
    PeerDropped { peer: PeerId, reason: String },
    /// We answered a catch-up probe.
    BacklogServed { to: PeerId, posts: usize },
    /// We broadcast a catch-up probe.
    CatchupSent,
    /// A disconnected peer was dialed back.
    Redialed { peer: PeerId },
    /// The single redial attempt failed.
    RedialFailed { peer: PeerId, reason: String },
    /// Discovery connected to an address.
    Dialed { addr: String },
    /// Discovery gave up on an address.
    DialFailed { addr: String, reason: String },
    /// Periodic status report.
    Status { peers: usize, posts: usize },
    /// Runtime encountered a non-fatal error.
    Error { description: String },
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to communicate with a running `HerdRuntime`.
///
/// Cheap to clone. All methods are channel sends.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
}

impl RuntimeHandle {
    /// Publish a post at a true position. The position is skewed before
    /// it is stored or transmitted; the returned post carries the skewed
    /// coordinates.
    pub async fn publish_post(
        &self,
        latitude: f64,
        longitude: f64,
        text: impl Into<String>,
    ) -> Result<Post, HerdProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.send(RuntimeCommand::PublishPost {
            latitude,
            longitude,
            text: text.into(),
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| HerdProtocolError::Shutdown)?
    }

    /// Every known post, most relevant to `(latitude, longitude)` first.
    pub async fn ranked_posts(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<Vec<RankedPost>, HerdProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.send(RuntimeCommand::RankedPosts {
            latitude,
            longitude,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| HerdProtocolError::Shutdown)?
    }

    /// Every known post, in insertion order.
    pub async fn posts(&self) -> Result<Vec<Post>, HerdProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.send(RuntimeCommand::Posts { reply: tx }).await?;
        rx.await.map_err(|_| HerdProtocolError::Shutdown)?
    }

    /// Number of connected peers (0 once shut down).
    pub async fn peer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(RuntimeCommand::PeerCount { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }

    async fn send(&self, cmd: RuntimeCommand) -> Result<(), HerdProtocolError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| HerdProtocolError::Shutdown)
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    /// Handle to send commands to the runtime.
    pub handle: RuntimeHandle,
    /// Receive protocol-level events.
    pub events: mpsc::Receiver<ProtocolEvent>,
}

// ── HerdRuntime ──────────────────────────────────────────────────────

/// The protocol runtime — spawn it and communicate via channels.
pub struct HerdRuntime;

impl HerdRuntime {
    /// Create and start the protocol runtime.
    ///
    /// `overlay_rx` is the overlay's inbound event queue. `directory` is
    /// queried on every discovery round when bootstrap servers are
    /// configured. Spawns the event loop as a tokio task.
    pub fn spawn<O: Overlay + 'static>(
        overlay: Arc<O>,
        overlay_rx: mpsc::UnboundedReceiver<OverlayEvent>,
        store: Arc<dyn PostStore>,
        keys: Box<dyn KeyGenerator>,
        directory: Option<Arc<dyn Directory>>,
        config: RuntimeConfig,
    ) -> Result<RuntimeChannels, HerdProtocolError> {
        let state = RuntimeState::new(config, store, keys)?;

        // Command channel (app → runtime)
        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(64);

        // Event channel (runtime → app)
        let (event_tx, event_rx) = mpsc::channel::<ProtocolEvent>(256);

        tokio::spawn(r#loop::runtime_loop(
            state, overlay, overlay_rx, cmd_rx, event_tx, directory,
        ));

        Ok(RuntimeChannels {
            handle: RuntimeHandle { cmd_tx },
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_constants() {
        let config = RuntimeConfig::new();
        assert_eq!(config.catchup_interval, Duration::from_secs(5));
        assert_eq!(config.discovery_interval, Duration::from_secs(30));
        assert_eq!(config.status_interval, Duration::from_secs(1));
        assert_eq!(config.fragment_size, 400);
        assert_eq!(config.ranking, RankingConfig { alpha: 0.3, beta: 0.3 });
    }

    #[test]
    fn builder_overrides() {
        let config = RuntimeConfig::new()
            .fragment_size(64)
            .bootstrap_servers(vec!["https://a".into()])
            .catchup_interval(Duration::from_millis(500));
        assert_eq!(config.fragment_size, 64);
        assert_eq!(config.bootstrap_servers, vec!["https://a"]);
        assert_eq!(config.catchup_interval, Duration::from_millis(500));
    }

    #[test]
    fn server_list_parsing() {
        assert_eq!(
            parse_server_list(" https://a.example , ,https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(parse_server_list("").is_empty());
    }
}
