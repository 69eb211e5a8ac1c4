use crate::events::{
    emit, EventPeerSummary, EventPublished, EventRanked, EventStarted, EventSummary,
};
use herd_protocol::{
    HerdRuntime, MemoryHub, MemoryPostStore, OsKeyGenerator, PeerId, PostStore, ProtocolEvent,
    RuntimeConfig, RuntimeHandle, SqlitePostStore,
};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Spread of authoring positions around the center, in degrees (~5 km).
const JITTER_DEG: f64 = 0.05;

pub struct SimulateConfig {
    pub peers: usize,
    pub posts: usize,
    pub latitude: f64,
    pub longitude: f64,
    pub duration: Duration,
    pub db_dir: Option<PathBuf>,
    pub top: usize,
    pub runtime: RuntimeConfig,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    dropped_peers: AtomicU64,
    backlogs_served: AtomicU64,
}

struct SimNode {
    id: PeerId,
    handle: RuntimeHandle,
    store: Arc<dyn PostStore>,
    counters: Arc<Counters>,
}

/// Run `peers` runtimes on one in-process hub, publish `posts` posts
/// round-robin, and wait for every store to hold all of them.
pub async fn run(config: SimulateConfig) -> anyhow::Result<()> {
    anyhow::ensure!(config.peers > 0, "need at least one peer");
    let start = Instant::now();
    let hub = MemoryHub::new();

    if let Some(dir) = &config.db_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut nodes = Vec::with_capacity(config.peers);
    for i in 0..config.peers {
        let id = PeerId::new(format!("herd-sim-{i}"));
        let store: Arc<dyn PostStore> = match &config.db_dir {
            Some(dir) => Arc::new(SqlitePostStore::open(dir.join(format!("{id}.sqlite3")))?),
            None => Arc::new(MemoryPostStore::new()),
        };
        let (overlay, overlay_rx) = hub.join(id.clone());
        let channels = HerdRuntime::spawn(
            Arc::new(overlay),
            overlay_rx,
            store.clone(),
            Box::new(OsKeyGenerator),
            None,
            config.runtime.clone(),
        )?;

        let counters = Arc::new(Counters::default());
        tokio::spawn(watch_events(id.clone(), channels.events, counters.clone()));
        emit(&EventStarted::new(id.as_str(), "simulate"));

        nodes.push(SimNode {
            id,
            handle: channels.handle,
            store,
            counters,
        });
    }

    let baseline = nodes
        .iter()
        .map(|n| n.store.count())
        .collect::<Result<Vec<_>, _>>()?;

    let mut rng = rand::rng();
    for n in 0..config.posts {
        let node = &nodes[n % nodes.len()];
        let lat = config.latitude + rng.random_range(-JITTER_DEG..=JITTER_DEG);
        let lon = config.longitude + rng.random_range(-JITTER_DEG..=JITTER_DEG);
        let post = node
            .handle
            .publish_post(lat, lon, format!("post #{n} from {}", node.id))
            .await?;
        emit(&EventPublished {
            event: "published",
            peer: node.id.to_string(),
            id: post.id,
            latitude: post.latitude,
            longitude: post.longitude,
        });
    }

    let deadline = Instant::now() + config.duration;
    let mut converged = false;
    while Instant::now() < deadline {
        converged = has_converged(&nodes, &baseline, config.posts)?;
        if converged {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if !converged {
        eprintln!(
            "not converged after {:.1}s, reporting partial state",
            config.duration.as_secs_f64()
        );
    }

    for node in &nodes {
        emit(&EventPeerSummary {
            event: "peer_summary",
            peer: node.id.to_string(),
            posts: node.store.count()?,
            accepted: node.counters.accepted.load(Ordering::Relaxed),
            rejected: node.counters.rejected.load(Ordering::Relaxed),
            dropped_peers: node.counters.dropped_peers.load(Ordering::Relaxed),
            backlogs_served: node.counters.backlogs_served.load(Ordering::Relaxed),
        });
    }

    let ranked = nodes[0]
        .handle
        .ranked_posts(config.latitude, config.longitude)
        .await?;
    for (i, entry) in ranked.iter().take(config.top).enumerate() {
        emit(&EventRanked {
            event: "ranked",
            rank: i + 1,
            id: entry.post.id.clone(),
            text: entry.post.text.clone(),
            distance_km: entry.distance_km(),
            age_hours: entry.age_hours,
            score: entry.score,
        });
    }

    emit(&EventSummary {
        event: "summary",
        peers: nodes.len(),
        published: config.posts,
        converged,
        elapsed_s: start.elapsed().as_secs_f64(),
    });

    for node in &nodes {
        node.handle.shutdown().await;
    }
    Ok(())
}

fn has_converged(nodes: &[SimNode], baseline: &[usize], published: usize) -> anyhow::Result<bool> {
    let expected = baseline.iter().copied().max().unwrap_or(0) + published;
    for node in nodes {
        if node.store.count()? < expected {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn watch_events(
    peer: PeerId,
    mut events: mpsc::Receiver<ProtocolEvent>,
    counters: Arc<Counters>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProtocolEvent::PostAccepted { id, from, channel } => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%peer, %from, %channel, id = %id, "post accepted");
            }
            ProtocolEvent::PostRejected { from, reason } => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%peer, %from, "post rejected: {reason}");
            }
            ProtocolEvent::PeerDropped { peer: dropped, reason } => {
                counters.dropped_peers.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%peer, %dropped, "peer dropped: {reason}");
            }
            ProtocolEvent::BacklogServed { to, posts } => {
                counters.backlogs_served.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%peer, %to, posts, "backlog served");
            }
            ProtocolEvent::Status { peers, posts } => {
                tracing::trace!(%peer, peers, posts, "status");
            }
            ProtocolEvent::Error { description } => {
                tracing::error!(%peer, "runtime error: {description}");
            }
            other => tracing::debug!(%peer, ?other, "event"),
        }
    }
}
