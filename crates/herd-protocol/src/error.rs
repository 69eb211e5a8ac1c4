use crate::types::{Channel, PeerId};

/// Protocol-level errors for Herd.
///
/// Wraps the per-layer errors (chunking, post codec, store, overlay,
/// discovery) so the runtime and the application see a single type.
#[derive(Debug, thiserror::Error)]
pub enum HerdProtocolError {
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Post(#[from] PostError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("runtime shut down")]
    Shutdown,
}

impl From<serde_json::Error> for HerdProtocolError {
    fn from(e: serde_json::Error) -> Self {
        HerdProtocolError::Serialization(e.to_string())
    }
}

/// Fragment-level failures. Any of them raised by an inbound fragment
/// marks the sender as misbehaving.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("malformed chunk: {reason}")]
    Malformed { reason: String },

    #[error("fragment size {size} below minimum of {min} bytes")]
    FragmentSizeTooSmall { size: usize, min: usize },

    /// Outbound only: the payload would exceed the receivers' limit.
    #[error("payload needs {fragments} fragments, limit is {max}")]
    TooManyFragments { fragments: usize, max: u32 },
}

/// Post authoring and verification failures.
#[derive(Debug, thiserror::Error)]
pub enum PostError {
    #[error("invalid public key: {reason}")]
    InvalidPublicKey { reason: String },

    #[error("post id {claimed} does not match key fingerprint {derived}")]
    IdMismatch { claimed: String, derived: String },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed signed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PostError {
    /// Whether the failure proves the sending peer is corrupt or hostile.
    ///
    /// Signature, key and signed-payload failures sever the connection.
    /// An envelope that does not even parse is logged and dropped.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            PostError::InvalidPublicKey { .. }
                | PostError::IdMismatch { .. }
                | PostError::InvalidSignature
                | PostError::MalformedPayload { .. }
        )
    }
}

/// Post store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored row {id}: {reason}")]
    InvalidRow { id: String, reason: String },

    #[error("store lock poisoned")]
    Poisoned,
}

/// Failures reported by the overlay network collaborator.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("publish on {channel} failed: {reason}")]
    Publish { channel: Channel, reason: String },

    #[error("dial {target} failed: {reason}")]
    Dial { target: String, reason: String },

    #[error("hang up {peer} failed: {reason}")]
    HangUp { peer: PeerId, reason: String },

    #[error("overlay is shut down")]
    Shutdown,
}

/// Directory (bootstrap server) failures.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory {server} returned an invalid listing: {reason}")]
    InvalidListing { server: String, reason: String },
}
