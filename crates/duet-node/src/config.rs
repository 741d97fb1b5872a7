//! Node configuration loaded from environment variables.
//!
//! Wraps the signaling and relay settings of `duet-net` and adds the
//! node-only choices: which store backs signaling and how often
//! connection statistics are sampled.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use duet_net::{RelayConfig, SignalingConfig};
use duet_shared::constants::DEFAULT_STATS_INTERVAL_MS;

/// Placeholder endpoint for the in-process store, which never dials out.
const LOCAL_ENDPOINT: &str = "http://localhost";
const LOCAL_API_KEY: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// In-process store; both peers must live in this process.
    Memory,
    /// PostgREST-style HTTP store at `DUET_ENDPOINT`.
    Rest,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "rest" => Ok(StoreKind::Rest),
            other => Err(format!("unknown store kind: {other}")),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Memory => f.write_str("memory"),
            StoreKind::Rest => f.write_str("rest"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub signaling: SignalingConfig,
    pub relay: RelayConfig,

    /// Env: `DUET_STORE` (`memory` | `rest`)
    /// Default: `rest`
    pub store: StoreKind,

    /// Env: `DUET_STATS_INTERVAL_MS`
    /// Default: 2000 ms
    pub stats_interval: Duration,

    /// Peer to send a `renegotiate` request to after connecting.
    /// Env: `DUET_PEER_ID`
    pub peer_id: Option<String>,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let store = match std::env::var("DUET_STORE") {
            Ok(val) => val.parse().unwrap_or_else(|e| {
                warn!(error = %e, "Invalid DUET_STORE, using rest");
                StoreKind::Rest
            }),
            Err(_) => StoreKind::Rest,
        };

        let mut stats_interval = Duration::from_millis(DEFAULT_STATS_INTERVAL_MS);
        if let Ok(val) = std::env::var("DUET_STATS_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) => stats_interval = Duration::from_millis(ms),
                Err(_) => warn!(value = %val, "Invalid DUET_STATS_INTERVAL_MS, using default"),
            }
        }

        let peer_id = std::env::var("DUET_PEER_ID").ok().filter(|p| !p.is_empty());

        Self::assemble(
            SignalingConfig::from_env(),
            RelayConfig::from_env(),
            store,
            stats_interval,
            peer_id,
        )
    }

    fn assemble(
        mut signaling: SignalingConfig,
        relay: RelayConfig,
        store: StoreKind,
        stats_interval: Duration,
        peer_id: Option<String>,
    ) -> Self {
        if store == StoreKind::Memory {
            if signaling.endpoint.trim().is_empty() {
                signaling.endpoint = LOCAL_ENDPOINT.to_string();
            }
            if signaling.api_key.trim().is_empty() {
                signaling.api_key = LOCAL_API_KEY.to_string();
            }
        }
        Self {
            signaling,
            relay,
            store,
            stats_interval,
            peer_id,
        }
    }
}
