//! Signaling and relay configuration loaded from environment variables.
//!
//! Every tunable has a default; only the endpoint, credentials and the
//! room/user identifiers must be supplied.

use std::time::Duration;

use tracing::warn;

use duet_shared::constants::{
    DEFAULT_PROBE_TIMEOUT_MS, HEARTBEAT_INTERVAL_SECS, MAX_HEARTBEAT_FAILURES,
    MAX_SIGNALS_PER_MINUTE, RATE_LIMIT_WINDOW_SECS, RETRY_QUEUE_CAPACITY,
};
use duet_shared::error::ConfigError;
use duet_shared::types::{PeerId, RoomId};

use crate::error::TurnError;
use crate::rest::parse_endpoint;
use crate::turn::TurnServer;

/// Signaling client configuration.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Base URL of the signaling store.
    /// Env: `DUET_ENDPOINT`
    pub endpoint: String,

    /// API key sent with every store request.
    /// Env: `DUET_API_KEY`
    pub api_key: String,

    /// Room to join (3-100 characters).
    /// Env: `DUET_ROOM_ID`
    pub room_id: String,

    /// Local peer id (3-50 characters).
    /// Env: `DUET_USER_ID`
    pub user_id: String,

    /// Presence heartbeat period.
    /// Env: `DUET_HEARTBEAT_SECS`
    /// Default: 30 s
    pub heartbeat_interval: Duration,

    /// Consecutive heartbeat failures tolerated before the connection is
    /// flagged as possibly lost.
    pub max_heartbeat_failures: u32,

    /// Signals allowed per rate-limit window.
    /// Env: `DUET_MAX_SIGNALS_PER_MINUTE`
    /// Default: 100
    pub max_signals_per_window: u32,

    /// Rate-limit window length (one minute).
    pub rate_limit_window: Duration,

    /// Signals kept for replay after transient send failures.
    pub retry_queue_capacity: usize,
}

impl SignalingConfig {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            max_heartbeat_failures: MAX_HEARTBEAT_FAILURES,
            max_signals_per_window: MAX_SIGNALS_PER_MINUTE,
            rate_limit_window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            retry_queue_capacity: RETRY_QUEUE_CAPACITY,
        }
    }

    /// Load configuration from environment variables. Missing required
    /// values are left empty and reported by [`SignalingConfig::validate`].
    pub fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var("DUET_ENDPOINT").unwrap_or_default(),
            std::env::var("DUET_API_KEY").unwrap_or_default(),
            std::env::var("DUET_ROOM_ID").unwrap_or_default(),
            std::env::var("DUET_USER_ID").unwrap_or_default(),
        );

        if let Ok(val) = std::env::var("DUET_HEARTBEAT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_interval = Duration::from_secs(secs),
                _ => warn!(value = %val, "Invalid DUET_HEARTBEAT_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("DUET_MAX_SIGNALS_PER_MINUTE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_signals_per_window = n,
                _ => warn!(value = %val, "Invalid DUET_MAX_SIGNALS_PER_MINUTE, using default"),
            }
        }

        config
    }

    /// Check constructor arguments: all present, a well-formed endpoint
    /// URI, and identifiers within their length bounds.
    pub fn validate(&self) -> Result<(RoomId, PeerId), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("endpoint"));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("api_key"));
        }
        if self.room_id.is_empty() {
            return Err(ConfigError::Missing("room_id"));
        }
        if self.user_id.is_empty() {
            return Err(ConfigError::Missing("user_id"));
        }
        parse_endpoint(&self.endpoint)?;
        let room = RoomId::parse(self.room_id.clone())?;
        let user = PeerId::parse(self.user_id.clone())?;
        Ok((room, user))
    }
}

/// Relay selection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Env: `DUET_TURN_SERVERS` (JSON array of `{urls, username, credential, priority}`)
    pub servers: Vec<TurnServer>,

    /// Env: `DUET_PROBE_TIMEOUT_MS`
    /// Default: 3000 ms
    pub probe_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            servers: default_turn_servers(),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(json) = std::env::var("DUET_TURN_SERVERS") {
            match parse_turn_servers(&json) {
                Ok(servers) => config.servers = servers,
                Err(e) => warn!(error = %e, "Invalid DUET_TURN_SERVERS, using defaults"),
            }
        }

        if let Ok(val) = std::env::var("DUET_PROBE_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.probe_timeout = Duration::from_millis(ms),
                Err(_) => warn!(value = %val, "Invalid DUET_PROBE_TIMEOUT_MS, using default"),
            }
        }

        config
    }
}

pub fn parse_turn_servers(json: &str) -> Result<Vec<TurnServer>, TurnError> {
    serde_json::from_str(json).map_err(|e| TurnError::Parse(e.to_string()))
}

/// Public STUN/TURN relays used when none are configured.
pub fn default_turn_servers() -> Vec<TurnServer> {
    vec![
        TurnServer {
            urls: vec![
                "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
                "turn:openrelay.metered.ca:80".to_string(),
            ],
            username: Some("openrelayproject".to_string()),
            credential: Some("openrelayproject".to_string()),
            priority: 10,
        },
        TurnServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
            priority: 5,
        },
        TurnServer {
            urls: vec!["stun:stun.cloudflare.com:3478".to_string()],
            username: None,
            credential: None,
            priority: 1,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_shared::error::ValidationError;

    fn valid() -> SignalingConfig {
        SignalingConfig::new("https://signal.example.com", "anon-key", "room-42", "alice")
    }

    #[test]
    fn test_valid_config() {
        let (room, user) = valid().validate().unwrap();
        assert_eq!(room.as_str(), "room-42");
        assert_eq!(user.as_str(), "alice");
    }

    #[test]
    fn test_missing_values() {
        let mut config = valid();
        config.api_key.clear();
        assert_eq!(config.validate(), Err(ConfigError::Missing("api_key")));

        let mut config = valid();
        config.room_id.clear();
        assert_eq!(config.validate(), Err(ConfigError::Missing("room_id")));
    }

    #[test]
    fn test_malformed_endpoint() {
        let mut config = valid();
        config.endpoint = "signal.example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_identifier_bounds() {
        let mut config = valid();
        config.room_id = "ab".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(ValidationError::Length { field: "room_id", .. }))
        ));

        let mut config = valid();
        config.user_id = "u".repeat(51);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(ValidationError::Length { field: "peer_id", .. }))
        ));
    }

    #[test]
    fn test_parse_turn_servers() {
        let servers = parse_turn_servers(
            r#"[{"urls":["turn:relay.example.com:3478"],"username":"u","credential":"c","priority":3}]"#,
        )
        .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].priority, 3);
        assert!(parse_turn_servers("{}").is_err());
    }

    #[test]
    fn test_default_servers_sorted_by_priority() {
        let servers = default_turn_servers();
        assert!(servers.windows(2).all(|w| w[0].priority >= w[1].priority));
    }
}
