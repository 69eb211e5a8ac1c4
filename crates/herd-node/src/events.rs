use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

/// RFC 3339 timestamp for JSONL events.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub peer: String,
    pub mode: String,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(peer: &str, mode: &str) -> Self {
        Self {
            event: "started",
            peer: peer.to_string(),
            mode: mode.to_string(),
            timestamp: now_iso(),
        }
    }
}

// ── Post events ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventPublished {
    pub event: &'static str,
    pub peer: String,
    pub id: String,
    pub latitude: String,
    pub longitude: String,
}

#[derive(Serialize)]
pub struct EventRanked {
    pub event: &'static str,
    pub rank: usize,
    pub id: String,
    pub text: String,
    pub distance_km: f64,
    pub age_hours: f64,
    pub score: f64,
}

#[derive(Serialize)]
pub struct EventSkewed {
    pub event: &'static str,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
}

// ── Directory events ────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventListing {
    pub event: &'static str,
    pub server: String,
    pub kind: &'static str,
    pub address: String,
    pub dialable: bool,
    pub fallback: Option<String>,
}

#[derive(Serialize)]
pub struct EventError {
    pub event: &'static str,
    pub context: String,
    pub error: String,
}

impl EventError {
    pub fn new(context: impl Into<String>, error: impl ToString) -> Self {
        Self {
            event: "error",
            context: context.into(),
            error: error.to_string(),
        }
    }
}

// ── Summary ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventPeerSummary {
    pub event: &'static str,
    pub peer: String,
    pub posts: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub dropped_peers: u64,
    pub backlogs_served: u64,
}

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub peers: usize,
    pub published: usize,
    pub converged: bool,
    pub elapsed_s: f64,
}
