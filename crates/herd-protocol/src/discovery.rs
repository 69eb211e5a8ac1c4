/// Bootstrap discovery — directory servers and dial-with-fallback.
///
/// A directory answers `GET <server>/api/listeners` and
/// `GET <server>/api/discovery` with a JSON array of multiaddrs. Only
/// websocket-secure addresses are dialed. A failed dial is retried once
/// on port 443, then abandoned until the next discovery round.
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{DiscoveryError, OverlayError};
use crate::runtime::Overlay;

/// Per-request timeout for directory queries.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Port substituted on the fallback dial.
const FALLBACK_PORT: u16 = 443;

/// Source of reachable peer addresses.
#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    /// Relay listeners advertised by `server`.
    async fn listeners(&self, server: &str) -> Result<Vec<String>, DiscoveryError>;

    /// Peers recently seen by `server`.
    async fn peers(&self, server: &str) -> Result<Vec<String>, DiscoveryError>;
}

// ── HTTP directory ───────────────────────────────────────────────────

/// Directory client over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new() -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client })
    }

    async fn fetch(&self, server: &str, endpoint: &str) -> Result<Vec<String>, DiscoveryError> {
        // Random query string defeats intermediary caches.
        let nonce: u64 = rand::random();
        let url = format!(
            "{}/api/{endpoint}?random={nonce:x}",
            server.trim_end_matches('/')
        );
        let body = self
            .client
            .get(&url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_listing(server, &body)
    }
}

#[async_trait::async_trait]
impl Directory for HttpDirectory {
    async fn listeners(&self, server: &str) -> Result<Vec<String>, DiscoveryError> {
        self.fetch(server, "listeners").await
    }

    async fn peers(&self, server: &str) -> Result<Vec<String>, DiscoveryError> {
        self.fetch(server, "discovery").await
    }
}

fn parse_listing(server: &str, body: &str) -> Result<Vec<String>, DiscoveryError> {
    serde_json::from_str(body).map_err(|e| DiscoveryError::InvalidListing {
        server: server.to_string(),
        reason: e.to_string(),
    })
}

// ── Address policy ───────────────────────────────────────────────────

/// Whether an address uses the websocket-secure transport.
pub fn is_websocket_secure(addr: &str) -> bool {
    addr.contains("wss")
}

/// Rewrite the first `/tcp/<port>/` segment to port 443.
///
/// `None` if the address has no such segment or already uses 443.
pub fn with_fallback_port(addr: &str) -> Option<String> {
    let mut search = 0;
    while let Some(offset) = addr[search..].find("/tcp/") {
        let port_start = search + offset + "/tcp/".len();
        let digits = addr[port_start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        let port_end = port_start + digits;
        if digits > 0 && addr[port_end..].starts_with('/') {
            let port = &addr[port_start..port_end];
            if port == FALLBACK_PORT.to_string() {
                return None;
            }
            return Some(format!(
                "{}{FALLBACK_PORT}{}",
                &addr[..port_start],
                &addr[port_end..]
            ));
        }
        search += offset + 1;
    }
    None
}

/// Dial `addr`; on failure dial once more on port 443.
///
/// Returns the address that connected.
pub async fn dial_with_fallback<O: Overlay + ?Sized>(
    overlay: &O,
    addr: &str,
) -> Result<String, OverlayError> {
    let first = match overlay.dial_addr(addr).await {
        Ok(()) => return Ok(addr.to_string()),
        Err(e) => e,
    };
    let Some(fallback) = with_fallback_port(addr) else {
        return Err(first);
    };
    tracing::debug!(%addr, error = %first, %fallback, "dial failed, retrying on port 443");
    overlay.dial_addr(&fallback).await?;
    Ok(fallback)
}

// ── Discovery round ──────────────────────────────────────────────────

/// Outcome of one discovery round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Addresses that connected (after fallback, if any).
    pub dialed: Vec<String>,
    /// Addresses abandoned after the fallback also failed.
    pub failed: Vec<(String, String)>,
    /// Addresses ignored because they are not websocket-secure.
    pub skipped: usize,
    /// Directory queries that failed.
    pub directory_errors: usize,
}

/// Query every server's listeners and peers and dial what they return.
///
/// A failing server is logged and skipped; the round continues.
pub async fn discover<O: Overlay + ?Sized>(
    directory: &dyn Directory,
    overlay: &O,
    servers: &[String],
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    let mut seen = HashSet::new();

    for server in servers {
        let listings = [
            ("listeners", directory.listeners(server).await),
            ("discovery", directory.peers(server).await),
        ];
        for (endpoint, listing) in listings {
            let addrs = match listing {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::warn!(%server, endpoint, error = %e, "directory query failed");
                    report.directory_errors += 1;
                    continue;
                }
            };
            for addr in addrs {
                if !is_websocket_secure(&addr) {
                    report.skipped += 1;
                    continue;
                }
                if !seen.insert(addr.clone()) {
                    continue;
                }
                match dial_with_fallback(overlay, &addr).await {
                    Ok(connected) => {
                        tracing::info!(addr = %connected, "dialed");
                        report.dialed.push(connected);
                    }
                    Err(e) => {
                        tracing::warn!(%addr, error = %e, "failed to dial, giving up");
                        report.failed.push((addr, e.to_string()));
                    }
                }
            }
        }
    }
    report
}
