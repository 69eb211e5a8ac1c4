//! Effect executor — the only place that touches I/O.
//!
//! Takes a list of RuntimeEffect and executes them concretely:
//! - Publish -> overlay.publish() per frame
//! - HangUp / Redial -> overlay.hang_up() / overlay.dial_peer()
//! - Discover -> spawned discovery round
//! - ReportStatus / Emit -> event_tx
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::discovery::{self, Directory};

use super::effect::RuntimeEffect;
use super::overlay::Overlay;
use super::ProtocolEvent;

/// I/O handles the executor works with.
pub(super) struct Executor<O: Overlay + 'static> {
    pub overlay: Arc<O>,
    pub directory: Option<Arc<dyn Directory>>,
    pub bootstrap_servers: Vec<String>,
    pub event_tx: mpsc::Sender<ProtocolEvent>,
}

impl<O: Overlay + 'static> Executor<O> {
    pub async fn execute(&self, effects: Vec<RuntimeEffect>) {
        for effect in effects {
            match effect {
                RuntimeEffect::Publish { channel, frames } => {
                    for frame in frames {
                        if let Err(e) = self.overlay.publish(channel, frame).await {
                            self.emit(ProtocolEvent::Error {
                                description: e.to_string(),
                            });
                            break;
                        }
                    }
                }
                RuntimeEffect::HangUp(peer) => {
                    if let Err(e) = self.overlay.hang_up(&peer).await {
                        tracing::warn!(%peer, error = %e, "hang up failed");
                    }
                }
                RuntimeEffect::Redial(peer) => match self.overlay.dial_peer(&peer).await {
                    Ok(()) => {
                        tracing::info!(%peer, "redialed");
                        self.emit(ProtocolEvent::Redialed { peer });
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "redial failed");
                        self.emit(ProtocolEvent::RedialFailed {
                            peer,
                            reason: e.to_string(),
                        });
                    }
                },
                RuntimeEffect::Discover => self.spawn_discovery(),
                RuntimeEffect::ReportStatus { posts } => {
                    let peers = self.overlay.peer_count().await;
                    self.emit(ProtocolEvent::Status { peers, posts });
                }
                RuntimeEffect::Emit(event) => self.emit(event),
            }
        }
    }

    /// Run a discovery round off the event loop; dials can be slow.
    fn spawn_discovery(&self) {
        let Some(directory) = self.directory.clone() else {
            return;
        };
        let overlay = self.overlay.clone();
        let servers = self.bootstrap_servers.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let report = discovery::discover(directory.as_ref(), overlay.as_ref(), &servers).await;
            tracing::debug!(
                dialed = report.dialed.len(),
                failed = report.failed.len(),
                skipped = report.skipped,
                "discovery round finished"
            );
            for addr in report.dialed {
                let _ = event_tx.try_send(ProtocolEvent::Dialed { addr });
            }
            for (addr, reason) in report.failed {
                let _ = event_tx.try_send(ProtocolEvent::DialFailed { addr, reason });
            }
        });
    }

    fn emit(&self, event: ProtocolEvent) {
        // try_send: never block the runtime on a slow consumer
        let _ = self.event_tx.try_send(event);
    }
}
