//! In-process overlay — every node attached to one `MemoryHub`.
//!
//! Used by the integration tests and the CLI simulation. Nodes joining a
//! hub are linked to every node already attached (full mesh). Publishing
//! delivers a frame to every linked node subscribed to the topic.
//!
//! Per-node queues are unbounded: a publish neither blocks nor loses
//! frames, so a backlog of any size arrives whole and in order.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::OverlayError;
use crate::types::{Channel, PeerId};

use super::overlay::{Overlay, OverlayEvent};

struct Node {
    events: mpsc::UnboundedSender<OverlayEvent>,
    topics: HashSet<String>,
    links: HashSet<PeerId>,
}

#[derive(Default)]
struct HubInner {
    nodes: HashMap<PeerId, Node>,
}

impl HubInner {
    fn notify(&self, to: &PeerId, event: OverlayEvent) {
        if let Some(node) = self.nodes.get(to) {
            if node.events.send(event).is_err() {
                tracing::debug!(peer = %to, "memory overlay receiver gone, event dropped");
            }
        }
    }

    fn link(&mut self, a: &PeerId, b: &PeerId) -> bool {
        if a == b || !self.nodes.contains_key(a) || !self.nodes.contains_key(b) {
            return false;
        }
        let mut fresh = false;
        if let Some(node) = self.nodes.get_mut(a) {
            fresh |= node.links.insert(b.clone());
        }
        if let Some(node) = self.nodes.get_mut(b) {
            fresh |= node.links.insert(a.clone());
        }
        if fresh {
            self.notify(a, OverlayEvent::PeerConnected { peer: b.clone() });
            self.notify(b, OverlayEvent::PeerConnected { peer: a.clone() });
        }
        true
    }

    fn unlink(&mut self, a: &PeerId, b: &PeerId) -> bool {
        let mut removed = false;
        if let Some(node) = self.nodes.get_mut(a) {
            removed |= node.links.remove(b);
        }
        if let Some(node) = self.nodes.get_mut(b) {
            removed |= node.links.remove(a);
        }
        removed
    }
}

/// Shared medium connecting `MemoryOverlay` nodes. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub").finish_non_exhaustive()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Multiaddr under which a hub node is reachable.
    pub fn address_of(peer: &PeerId) -> String {
        format!("/dns4/{peer}.herd.local/tcp/4001/wss/p2p/{peer}")
    }

    /// Attach a node and link it to every node already on the hub.
    ///
    /// Returns the node's overlay handle and its inbound event queue.
    pub fn join(&self, peer: PeerId) -> (MemoryOverlay, mpsc::UnboundedReceiver<OverlayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inner) = self.inner.lock() {
            let others: Vec<PeerId> = inner.nodes.keys().cloned().collect();
            inner.nodes.insert(
                peer.clone(),
                Node {
                    events: tx,
                    topics: HashSet::new(),
                    links: HashSet::new(),
                },
            );
            for other in &others {
                inner.link(&peer, other);
            }
        }
        let overlay = MemoryOverlay {
            local: peer,
            hub: self.clone(),
        };
        (overlay, rx)
    }

    /// Detach a node. Its peers observe a disconnect.
    pub fn leave(&self, peer: &PeerId) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(node) = inner.nodes.remove(peer) {
                for other in node.links {
                    if let Some(remote) = inner.nodes.get_mut(&other) {
                        remote.links.remove(peer);
                    }
                    inner.notify(&other, OverlayEvent::PeerDisconnected { peer: peer.clone() });
                }
            }
        }
    }

    /// Peers currently attached.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .map(|inner| inner.nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubInner>, OverlayError> {
        self.inner.lock().map_err(|_| OverlayError::Shutdown)
    }
}

/// One node's view of a `MemoryHub`.
#[derive(Debug, Clone)]
pub struct MemoryOverlay {
    local: PeerId,
    hub: MemoryHub,
}

impl MemoryOverlay {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

fn peer_of_addr(addr: &str) -> Option<PeerId> {
    let (_, id) = addr.rsplit_once("/p2p/")?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(PeerId::new(id))
}

#[async_trait::async_trait]
impl Overlay for MemoryOverlay {
    async fn subscribe(&self, channel: Channel) -> Result<(), OverlayError> {
        let mut inner = self.hub.lock()?;
        let node = inner.nodes.get_mut(&self.local).ok_or(OverlayError::Shutdown)?;
        node.topics.insert(channel.as_str().to_string());
        Ok(())
    }

    async fn publish(&self, channel: Channel, data: Bytes) -> Result<(), OverlayError> {
        let inner = self.hub.lock()?;
        let node = inner.nodes.get(&self.local).ok_or(OverlayError::Shutdown)?;
        let topic = channel.as_str();
        for peer in &node.links {
            let subscribed = inner
                .nodes
                .get(peer)
                .is_some_and(|remote| remote.topics.contains(topic));
            if subscribed {
                inner.notify(
                    peer,
                    OverlayEvent::MessageReceived {
                        topic: topic.to_string(),
                        from: self.local.clone(),
                        data: data.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn dial_addr(&self, addr: &str) -> Result<(), OverlayError> {
        let Some(peer) = peer_of_addr(addr) else {
            return Err(OverlayError::Dial {
                target: addr.to_string(),
                reason: "no /p2p/ component".into(),
            });
        };
        let expected = MemoryHub::address_of(&peer);
        if addr != expected {
            return Err(OverlayError::Dial {
                target: addr.to_string(),
                reason: "no listener at this address".into(),
            });
        }
        self.dial_peer(&peer).await
    }

    async fn dial_peer(&self, peer: &PeerId) -> Result<(), OverlayError> {
        let mut inner = self.hub.lock()?;
        if inner.link(&self.local, peer) {
            Ok(())
        } else {
            Err(OverlayError::Dial {
                target: peer.to_string(),
                reason: "peer not reachable".into(),
            })
        }
    }

    async fn hang_up(&self, peer: &PeerId) -> Result<(), OverlayError> {
        let mut inner = self.hub.lock()?;
        if inner.unlink(&self.local, peer) {
            inner.notify(
                peer,
                OverlayEvent::PeerDisconnected {
                    peer: self.local.clone(),
                },
            );
        }
        Ok(())
    }

    async fn peer_count(&self) -> usize {
        self.hub
            .lock()
            .ok()
            .and_then(|inner| inner.nodes.get(&self.local).map(|node| node.links.len()))
            .unwrap_or(0)
    }
}
