use thiserror::Error;

/// A unit of data (signal, constraint set, stats report) failed validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing or empty field: {0}")]
    EmptyField(&'static str),

    #[error("Field {field} has length {len} (allowed {min}..={max})")]
    Length {
        field: &'static str,
        len: usize,
        min: usize,
        max: usize,
    },

    #[error("Signal too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Unknown signal type: {0}")]
    UnknownSignalType(String),

    #[error("Neither audio nor video requested")]
    NoMediaRequested,

    #[error("Invalid constraint {field}: {reason}")]
    InvalidConstraint { field: String, reason: String },

    #[error("Invalid metric {field}: {value}")]
    InvalidMetric { field: &'static str, value: f64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Constructor arguments were missing or malformed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(&'static str),

    #[error("Invalid endpoint URI: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid configuration value: {0}")]
    Invalid(#[from] ValidationError),
}
