/// The protocol runtime event loop.
///
/// A single async task that owns all mutable protocol state and
/// multiplexes over overlay events, application commands, and the
/// scheduler's next deadline.
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::discovery::Directory;
use crate::types::Channel;

use super::effect::RuntimeEffect;
use super::executor::Executor;
use super::overlay::{Overlay, OverlayEvent};
use super::scheduler::{Scheduler, TaskKind};
use super::state::RuntimeState;
use super::{ProtocolEvent, RuntimeCommand};

/// Main event loop — owns all protocol state.
pub(super) async fn runtime_loop<O: Overlay + 'static>(
    mut state: RuntimeState,
    overlay: Arc<O>,
    mut overlay_rx: mpsc::UnboundedReceiver<OverlayEvent>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    event_tx: mpsc::Sender<ProtocolEvent>,
    directory: Option<Arc<dyn Directory>>,
) {
    let config = state.config().clone();
    let executor = Executor {
        overlay: overlay.clone(),
        directory,
        bootstrap_servers: config.bootstrap_servers.clone(),
        event_tx,
    };

    for channel in Channel::ALL {
        if let Err(e) = overlay.subscribe(channel).await {
            tracing::warn!(%channel, error = %e, "subscribe failed");
            executor
                .execute(vec![RuntimeEffect::Emit(ProtocolEvent::Error {
                    description: e.to_string(),
                })])
                .await;
        }
    }

    // ── Timers ──────────────────────────────────────────────────────
    // The probe and discovery fire right away; status waits one period.
    let start = Instant::now();
    let mut scheduler = Scheduler::new();
    scheduler.register(TaskKind::CatchupProbe, config.catchup_interval, start, true);
    scheduler.register(TaskKind::Discovery, config.discovery_interval, start, true);
    scheduler.register(TaskKind::StatusRefresh, config.status_interval, start, false);

    let mut overlay_open = true;
    tracing::debug!("runtime started");

    loop {
        let deadline = scheduler.next_deadline();
        tokio::select! {
            event = overlay_rx.recv(), if overlay_open => {
                match event {
                    Some(event) => {
                        let effects = state.handle_overlay_event(event, Utc::now());
                        executor.execute(effects).await;
                    }
                    None => {
                        tracing::info!("overlay event queue closed");
                        overlay_open = false;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RuntimeCommand::PublishPost { latitude, longitude, text, reply }) => {
                        match state.publish_post(latitude, longitude, &text, Utc::now()) {
                            Ok((post, effects)) => {
                                executor.execute(effects).await;
                                let _ = reply.send(Ok(post));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Some(RuntimeCommand::RankedPosts { latitude, longitude, reply }) => {
                        let _ = reply.send(state.ranked_posts(latitude, longitude, Utc::now()));
                    }
                    Some(RuntimeCommand::Posts { reply }) => {
                        let _ = reply.send(state.posts());
                    }
                    Some(RuntimeCommand::PeerCount { reply }) => {
                        let _ = reply.send(overlay.peer_count().await);
                    }
                    Some(RuntimeCommand::Shutdown) | None => {
                        scheduler.stop_all();
                        tracing::debug!("runtime shutting down");
                        break;
                    }
                }
            }

            _ = sleep_until(deadline) => {
                let mut effects = Vec::new();
                for task in scheduler.due(Instant::now()) {
                    effects.extend(state.tick(task));
                }
                executor.execute(effects).await;
            }
        }
    }
}

/// Sleep until `deadline`, or forever when nothing is scheduled.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
