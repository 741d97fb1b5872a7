use thiserror::Error;

use duet_shared::error::{ConfigError, ValidationError};

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Not connected to signaling channel")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connection(StoreError),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(ValidationError),

    #[error("Invalid signal: {0}")]
    InvalidSignal(ValidationError),

    #[error("Transport error: {0}")]
    Transport(StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("No relay servers configured")]
    NoServers,

    #[error("Relay server at position {0} has no URLs")]
    MissingUrls(usize),

    #[error("Invalid relay server list: {0}")]
    Parse(String),
}
