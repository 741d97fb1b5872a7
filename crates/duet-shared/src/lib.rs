//! # duet-shared
//!
//! Data model, wire records and small utilities shared by the signaling,
//! relay-selection and media crates.

pub mod backoff;
pub mod constants;
pub mod error;
pub mod ids;
pub mod protocol;
pub mod timing;
pub mod types;
pub mod validation;

pub use backoff::{backoff_delay, Backoff};
pub use error::{ConfigError, ValidationError};
pub use ids::generate_secure_id;
pub use protocol::{PresenceEvent, PresenceRecord, SignalMessage, SignalRecord};
pub use timing::{Debouncer, Throttle};
pub use types::{PeerId, PresenceStatus, RoomId, SignalType};
