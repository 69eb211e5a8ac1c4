/// SyncCoordinator — catch-up probes, backlog replies, redial policy.
///
/// Every peer periodically publishes an empty probe on `catchup`. Any peer
/// that hears a probe answers on `backlog` with its whole store, each post
/// rebuilt from its stored `raw` payload. A store too large for one
/// message goes out as several backlog arrays, each within the fragment
/// limit receivers enforce. Receivers run every backlog entry
/// through `PostCodec::verify` independently; known ids are cheap no-ops.
///
/// Replying with the full store to every probe costs O(peers × posts)
/// per interval. That ceiling is accepted in exchange for needing no
/// per-peer knowledge of what others already hold.
use crate::error::{HerdProtocolError, PostError};
use crate::post::Envelope;
use crate::store::PostStore;
use crate::types::PeerId;

/// Reassembled payload of a catch-up probe. Content is irrelevant.
pub const CATCHUP_PROBE: &str = "{}";

/// Outcome of a peer disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectAction {
    /// Dial the peer once more. No retry if that fails.
    Redial(PeerId),
}

/// One serialized backlog array ready to fragment onto `backlog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogReply {
    pub payload: String,
    /// Number of posts in the reply.
    pub posts: usize,
}

/// Length of `[]`.
const EMPTY_ARRAY_LEN: usize = 2;

fn seal(entries: &[String]) -> Result<BacklogReply, HerdProtocolError> {
    Ok(BacklogReply {
        payload: serde_json::to_string(entries)?,
        posts: entries.len(),
    })
}

/// Stateless policy for the three sync channels.
#[derive(Debug, Clone, Default)]
pub struct SyncCoordinator;

impl SyncCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Payload published on every catch-up tick.
    pub fn probe_payload(&self) -> &'static str {
        CATCHUP_PROBE
    }

    /// Serialize the full store as backlog replies of at most `max_len`
    /// bytes each, in store order.
    ///
    /// Empty when there is nothing to offer. Posts whose `raw` payload is
    /// empty cannot be re-broadcast verbatim and are skipped, as is a post
    /// that alone exceeds `max_len`.
    pub fn backlog_replies(
        &self,
        store: &dyn PostStore,
        max_len: usize,
    ) -> Result<Vec<BacklogReply>, HerdProtocolError> {
        let mut replies = Vec::new();
        let mut batch: Vec<String> = Vec::new();
        // Serialized length of `batch`, brackets and commas included.
        let mut batch_len = EMPTY_ARRAY_LEN;

        for post in store.get_many()? {
            if post.raw.is_empty() {
                tracing::debug!(id = %post.id, "skipping post without raw payload in backlog");
                continue;
            }
            let entry = post.envelope().to_json()?;
            let entry_len = serde_json::to_string(&entry)?.len();
            if EMPTY_ARRAY_LEN + entry_len > max_len {
                tracing::warn!(id = %post.id, bytes = entry_len, "post too large for a backlog reply");
                continue;
            }
            if !batch.is_empty() && batch_len + 1 + entry_len > max_len {
                replies.push(seal(&batch)?);
                batch.clear();
                batch_len = EMPTY_ARRAY_LEN;
            }
            if !batch.is_empty() {
                batch_len += 1;
            }
            batch_len += entry_len;
            batch.push(entry);
        }
        if !batch.is_empty() {
            replies.push(seal(&batch)?);
        }
        Ok(replies)
    }

    /// Split a backlog reply into envelopes.
    ///
    /// The outer array must parse; each element is judged on its own so a
    /// single bad entry does not discard the rest.
    pub fn parse_backlog(
        &self,
        payload: &str,
    ) -> Result<Vec<Result<Envelope, PostError>>, HerdProtocolError> {
        let entries: Vec<String> = serde_json::from_str(payload)?;
        Ok(entries.iter().map(|entry| Envelope::from_json(entry)).collect())
    }

    /// Reaction to an overlay disconnect notification.
    pub fn on_disconnect(&self, peer: &PeerId) -> DisconnectAction {
        DisconnectAction::Redial(peer.clone())
    }
}
