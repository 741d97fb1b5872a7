//! Latency-based relay selection.
//!
//! Probes every configured STUN/TURN server concurrently, keeps the fastest
//! one cached for a few minutes, and exposes the priority order for
//! fallback when the selected relay stops working.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use duet_shared::constants::{MIN_PROBE_TIMEOUT_MS, TURN_CACHE_TTL_SECS};

use crate::error::TurnError;

const CACHE_TTL: Duration = Duration::from_secs(TURN_CACHE_TTL_SECS);

/// A STUN/TURN relay descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl TurnServer {
    /// Host of the first URL (`turn:host:port?transport=udp` -> `host`).
    pub fn host(&self) -> Option<&str> {
        self.urls.first().and_then(|url| parse_host(url))
    }

    /// ICE server entry for the peer-connection configuration.
    pub fn to_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn parse_host(uri: &str) -> Option<&str> {
    let (_scheme, rest) = uri.split_once(':')?;
    let rest = rest.trim_start_matches("//");
    let rest = rest.split(['?', '/']).next().unwrap_or(rest);

    let host = if let Some(bracketed) = rest.strip_prefix('[') {
        bracketed.split_once(']').map(|(host, _)| host)?
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => rest,
        }
    };

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Measures reachability latency of a relay.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Round-trip time to `server`, or `None` if it could not be reached.
    async fn probe(&self, server: &TurnServer) -> Option<Duration>;
}

/// Times an HTTP `HEAD` request against the relay's host. Any response,
/// whatever its status, counts as reachable.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LatencyProbe for HttpProbe {
    async fn probe(&self, server: &TurnServer) -> Option<Duration> {
        let host = server.host()?;
        let url = if host.contains(':') {
            format!("https://[{host}]")
        } else {
            format!("https://{host}")
        };

        let start = Instant::now();
        match self.client.head(&url).send().await {
            Ok(_) => Some(start.elapsed()),
            Err(e) => {
                debug!(host, error = %e, "Relay probe failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSelection {
    index: usize,
    latency: Option<Duration>,
    probed_at: Instant,
}

impl CachedSelection {
    fn is_fresh(&self) -> bool {
        self.probed_at.elapsed() < CACHE_TTL
    }
}

pub struct TurnSelector {
    servers: Vec<TurnServer>,
    probe: Arc<dyn LatencyProbe>,
    probe_timeout: Duration,
    cache: Mutex<Option<CachedSelection>>,
}

impl TurnSelector {
    /// Build a selector that probes with [`HttpProbe`].
    pub fn new(servers: Vec<TurnServer>, probe_timeout: Duration) -> Result<Self, TurnError> {
        Self::with_probe(servers, probe_timeout, Arc::new(HttpProbe::new()))
    }

    pub fn with_probe(
        mut servers: Vec<TurnServer>,
        probe_timeout: Duration,
        probe: Arc<dyn LatencyProbe>,
    ) -> Result<Self, TurnError> {
        if servers.is_empty() {
            return Err(TurnError::NoServers);
        }
        if let Some(index) = servers.iter().position(|s| s.urls.is_empty()) {
            return Err(TurnError::MissingUrls(index));
        }

        // Stable: equal priorities keep their configured order.
        servers.sort_by(|a, b| b.priority.cmp(&a.priority));

        let floor = Duration::from_millis(MIN_PROBE_TIMEOUT_MS);
        let probe_timeout = if probe_timeout < floor {
            warn!(
                requested_ms = probe_timeout.as_millis() as u64,
                floor_ms = MIN_PROBE_TIMEOUT_MS,
                "Probe timeout below minimum, raising"
            );
            floor
        } else {
            probe_timeout
        };

        Ok(Self {
            servers,
            probe,
            probe_timeout,
            cache: Mutex::new(None),
        })
    }

    fn cache(&self) -> MutexGuard<'_, Option<CachedSelection>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Servers in priority order (highest first).
    pub fn ordered_servers(&self) -> &[TurnServer] {
        &self.servers
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// The lowest-latency server, probing only if the cached choice is
    /// older than five minutes. If every probe fails the highest-priority
    /// server is returned.
    pub async fn select_optimal_server(&self) -> TurnServer {
        if let Some(cached) = self.cache().as_ref().filter(|c| c.is_fresh()) {
            debug!(
                server = ?self.servers[cached.index].urls.first(),
                "Using cached relay selection"
            );
            return self.servers[cached.index].clone();
        }

        let timeout = self.probe_timeout;
        let latencies = join_all(self.servers.iter().map(|server| {
            let probe = self.probe.clone();
            async move {
                tokio::time::timeout(timeout, probe.probe(server))
                    .await
                    .ok()
                    .flatten()
            }
        }))
        .await;

        let mut best: Option<(usize, Duration)> = None;
        for (index, latency) in latencies.iter().enumerate() {
            debug!(
                server = ?self.servers[index].urls.first(),
                latency_ms = latency.map(|l| l.as_millis() as u64),
                "Relay probe result"
            );
            if let Some(latency) = *latency {
                if best.map_or(true, |(_, fastest)| latency < fastest) {
                    best = Some((index, latency));
                }
            }
        }

        let (index, latency) = match best {
            Some((index, latency)) => (index, Some(latency)),
            None => {
                warn!("All relay probes failed, falling back to highest-priority server");
                (0, None)
            }
        };

        info!(
            server = ?self.servers[index].urls.first(),
            latency_ms = latency.map(|l| l.as_millis() as u64),
            "Selected relay server"
        );

        *self.cache() = Some(CachedSelection {
            index,
            latency,
            probed_at: Instant::now(),
        });

        self.servers[index].clone()
    }

    /// Latency measured for the cached selection, if any.
    pub fn cached_latency(&self) -> Option<Duration> {
        self.cache().as_ref().and_then(|c| c.latency)
    }

    /// The next lower-priority server after `current`, or `None` if
    /// `current` is last or unknown.
    pub fn get_next_fallback(&self, current: &TurnServer) -> Option<&TurnServer> {
        let position = self.servers.iter().position(|s| s == current)?;
        self.servers.get(position + 1)
    }

    /// Forget the cached selection so the next call probes again.
    pub fn clear_cache(&self) {
        *self.cache() = None;
    }
}
