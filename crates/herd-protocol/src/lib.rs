//! Herd protocol layer.
//!
//! Anonymous, geotagged text posts gossiped over a pub/sub overlay with no
//! server of record. Every post is signed by a one-off Ed25519 identity
//! whose fingerprint is the post id; peers verify, deduplicate and rank
//! posts locally by distance and age.
//!
//! Wire format: JSON, cut into `{index, total, content}` fragments.
//! Channels: `posts` (new posts), `catchup` (probes), `backlog` (replies).

pub mod chunk;
pub mod discovery;
pub mod error;
pub mod geo;
pub mod identity;
pub mod location;
pub mod post;
pub mod ranking;
pub mod router;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod types;

pub use chunk::{ChunkCodec, ChunkPacket, DEFAULT_FRAGMENT_SIZE};
pub use discovery::{Directory, DiscoveryReport, HttpDirectory};
pub use error::{
    ChunkError, DiscoveryError, HerdProtocolError, OverlayError, PostError, StoreError,
};
pub use identity::{KeyGenerator, OsKeyGenerator, SeededKeyGenerator};
pub use location::{skew_location, Coordinate, SkewConfig};
pub use post::{AuthoredPost, Envelope, Post, PostCodec, Verdict};
pub use ranking::{RankedPost, RankingConfig, RankingEngine};
pub use router::{Inbound, OverlayRouter, RouterAction};
pub use runtime::{
    HerdRuntime, MemoryHub, MemoryOverlay, Overlay, OverlayEvent, ProtocolEvent, RuntimeChannels,
    RuntimeCommand, RuntimeConfig, RuntimeHandle,
};
pub use store::{MemoryPostStore, PostField, PostStore, SqlitePostStore};
pub use sync::{BacklogReply, SyncCoordinator};
pub use types::{Channel, PeerId};
