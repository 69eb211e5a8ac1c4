//! Fragmentation of string payloads over size-limited pub/sub channels.
//!
//! A payload is cut into contiguous slices, each wrapped in a
//! `{"index", "total", "content"}` packet. The receiving side keeps one
//! reassembly buffer per (sender, channel) and releases the joined string
//! only once every index in `0..total` is present. Fragments may arrive in
//! any order, duplicated, or never.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ChunkError, HerdProtocolError};
use crate::types::{Channel, PeerId};

/// Fragment size used on the wire (bytes of content per packet).
pub const DEFAULT_FRAGMENT_SIZE: usize = 400;

/// Smallest fragment size that can always carry one UTF-8 character.
pub const MIN_FRAGMENT_SIZE: usize = 4;

/// Upper bound on `total`, both accepted from a peer and emitted locally.
pub const DEFAULT_MAX_FRAGMENTS: u32 = 4096;

/// Bytes a slice may fall short of the fragment size so that it ends on a
/// UTF-8 character boundary.
const BOUNDARY_SLACK: usize = MIN_FRAGMENT_SIZE - 1;

/// One fragment of a larger payload, as carried on every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPacket {
    pub index: u32,
    pub total: u32,
    pub content: String,
}

impl ChunkPacket {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse and validate a packet received from the wire.
    ///
    /// `index` must be a non-negative integer below `total`, `total` must be
    /// positive and `content` non-empty.
    pub fn parse(data: &[u8]) -> Result<Self, ChunkError> {
        let packet: ChunkPacket =
            serde_json::from_slice(data).map_err(|e| ChunkError::Malformed {
                reason: e.to_string(),
            })?;
        if packet.total == 0 {
            return Err(ChunkError::Malformed {
                reason: "total is zero".into(),
            });
        }
        if packet.index >= packet.total {
            return Err(ChunkError::Malformed {
                reason: format!("index {} out of range for total {}", packet.index, packet.total),
            });
        }
        if packet.content.is_empty() {
            return Err(ChunkError::Malformed {
                reason: "empty content".into(),
            });
        }
        Ok(packet)
    }
}

/// Cut `payload` into contiguous slices of at most `max_size` bytes.
///
/// Slices never split a UTF-8 character. An empty payload yields no
/// slices (an empty fragment would be rejected by every receiver).
pub fn split(payload: &str, max_size: usize) -> Result<Vec<&str>, ChunkError> {
    if max_size < MIN_FRAGMENT_SIZE {
        return Err(ChunkError::FragmentSizeTooSmall {
            size: max_size,
            min: MIN_FRAGMENT_SIZE,
        });
    }
    Ok(split_unchecked(payload, max_size))
}

fn split_unchecked(payload: &str, max_size: usize) -> Vec<&str> {
    let mut slices = Vec::with_capacity(payload.len().div_ceil(max_size));
    let mut rest = payload;
    while !rest.is_empty() {
        let mut end = rest.len().min(max_size);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        slices.push(head);
        rest = tail;
    }
    slices
}

/// Partially received message from one sender on one channel.
#[derive(Debug)]
struct PendingMessage {
    total: u32,
    fragments: BTreeMap<u32, String>,
}

impl PendingMessage {
    fn new(total: u32) -> Self {
        Self {
            total,
            fragments: BTreeMap::new(),
        }
    }

    /// Every index in `0..total` is present. Keys are validated to lie
    /// in `0..total`, so counting them is enough.
    fn is_complete(&self) -> bool {
        self.fragments.len() == self.total as usize
    }

    /// Whether `packet` cannot belong to the message being collected.
    ///
    /// Packets carry no message id, so only two cases are detectable: a
    /// different `total`, or different content at an index already held.
    /// A fragment of the next message that fills a hole left by a lost
    /// fragment of the previous one, with the same `total`, is merged.
    /// The joined payload then fails envelope parsing or verification
    /// downstream.
    fn conflicts_with(&self, packet: &ChunkPacket) -> bool {
        if packet.total != self.total {
            return true;
        }
        matches!(self.fragments.get(&packet.index), Some(existing) if *existing != packet.content)
    }

    fn join(self) -> String {
        self.fragments.into_values().collect()
    }
}

/// Splits outbound payloads and reassembles inbound fragments.
///
/// At most one message per (sender, channel) is in flight: a fragment that
/// cannot belong to the current buffer (different `total`, or a different
/// content for an index already held) starts a new buffer.
#[derive(Debug)]
pub struct ChunkCodec {
    fragment_size: usize,
    max_fragments: u32,
    buffers: HashMap<(PeerId, Channel), PendingMessage>,
}

impl ChunkCodec {
    /// Create a codec emitting fragments of at most `fragment_size` bytes.
    pub fn new(fragment_size: usize) -> Result<Self, ChunkError> {
        if fragment_size < MIN_FRAGMENT_SIZE {
            return Err(ChunkError::FragmentSizeTooSmall {
                size: fragment_size,
                min: MIN_FRAGMENT_SIZE,
            });
        }
        Ok(Self {
            fragment_size,
            max_fragments: DEFAULT_MAX_FRAGMENTS,
            buffers: HashMap::new(),
        })
    }

    /// Override the largest `total` accepted from a peer.
    pub fn with_max_fragments(mut self, max_fragments: u32) -> Self {
        self.max_fragments = max_fragments.max(1);
        self
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Largest `total` this codec emits or accepts.
    pub fn max_fragments(&self) -> u32 {
        self.max_fragments
    }

    /// Longest payload, in bytes, guaranteed to fit in `max_fragments`
    /// fragments whatever its characters.
    pub fn max_payload_len(&self) -> usize {
        (self.fragment_size - BOUNDARY_SLACK) * self.max_fragments as usize
    }

    /// Split a payload into numbered packets.
    ///
    /// Fails with `TooManyFragments` when the payload needs more fragments
    /// than a receiver with the same limit would accept.
    pub fn fragment(&self, payload: &str) -> Result<Vec<ChunkPacket>, ChunkError> {
        let slices = split_unchecked(payload, self.fragment_size);
        if slices.len() > self.max_fragments as usize {
            return Err(ChunkError::TooManyFragments {
                fragments: slices.len(),
                max: self.max_fragments,
            });
        }
        let total = slices.len() as u32;
        Ok(slices
            .into_iter()
            .enumerate()
            .map(|(index, content)| ChunkPacket {
                index: index as u32,
                total,
                content: content.to_string(),
            })
            .collect())
    }

    /// Split a payload and serialize every packet to wire bytes.
    pub fn encode(&self, payload: &str) -> Result<Vec<Vec<u8>>, HerdProtocolError> {
        self.fragment(payload)?
            .iter()
            .map(|packet| packet.to_bytes().map_err(HerdProtocolError::from))
            .collect()
    }

    /// Feed raw wire bytes received from `sender` on `channel`.
    ///
    /// Returns `Ok(Some(payload))` when the message is complete. On `Err`
    /// the sender's in-flight buffer for this channel is discarded and the
    /// caller should drop the peer.
    pub fn ingest(
        &mut self,
        sender: &PeerId,
        channel: Channel,
        data: &[u8],
    ) -> Result<Option<String>, ChunkError> {
        match ChunkPacket::parse(data) {
            Ok(packet) => self.ingest_packet(sender, channel, packet),
            Err(e) => {
                self.buffers.remove(&(sender.clone(), channel));
                Err(e)
            }
        }
    }

    /// Feed an already parsed packet.
    pub fn ingest_packet(
        &mut self,
        sender: &PeerId,
        channel: Channel,
        packet: ChunkPacket,
    ) -> Result<Option<String>, ChunkError> {
        let key = (sender.clone(), channel);
        if packet.total > self.max_fragments {
            self.buffers.remove(&key);
            return Err(ChunkError::Malformed {
                reason: format!(
                    "total {} exceeds limit of {}",
                    packet.total, self.max_fragments
                ),
            });
        }
        if packet.total == 0 || packet.index >= packet.total || packet.content.is_empty() {
            self.buffers.remove(&key);
            return Err(ChunkError::Malformed {
                reason: format!("invalid packet {}/{}", packet.index, packet.total),
            });
        }

        let restart = self
            .buffers
            .get(&key)
            .is_some_and(|pending| pending.conflicts_with(&packet));
        if restart {
            tracing::debug!(%sender, %channel, "new message replaces unfinished reassembly");
            self.buffers.remove(&key);
        }

        let pending = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| PendingMessage::new(packet.total));
        pending.fragments.insert(packet.index, packet.content);

        if !pending.is_complete() {
            return Ok(None);
        }
        Ok(self.buffers.remove(&key).map(PendingMessage::join))
    }

    /// Discard every in-flight buffer of a peer (on disconnect).
    pub fn reset(&mut self, peer: &PeerId) {
        self.buffers.retain(|(sender, _), _| sender != peer);
    }

    /// Number of (sender, channel) reassemblies currently in flight.
    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }
}
