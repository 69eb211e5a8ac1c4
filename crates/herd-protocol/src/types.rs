use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HerdProtocolError;

/// Logical pub/sub channel. Decides how a reassembled payload is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Single freshly authored post envelopes.
    Posts,
    /// Empty probe asking every listener for its full backlog.
    Catchup,
    /// JSON array of stringified envelopes answering a probe.
    Backlog,
}

impl Channel {
    /// Every channel a node subscribes to.
    pub const ALL: [Channel; 3] = [Channel::Posts, Channel::Catchup, Channel::Backlog];

    /// Topic name on the overlay.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Posts => "posts",
            Channel::Catchup => "catchup",
            Channel::Backlog => "backlog",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = HerdProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posts" => Ok(Channel::Posts),
            "catchup" => Ok(Channel::Catchup),
            "backlog" => Ok(Channel::Backlog),
            other => Err(HerdProtocolError::UnknownChannel(other.to_string())),
        }
    }
}

/// Overlay-level identity of a remote peer.
///
/// Opaque to the protocol: only used to key reassembly buffers and to
/// address hang-ups and redials.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        };
        write!(f, "PeerId({short})")
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
