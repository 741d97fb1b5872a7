//! Boundary to the persisted signaling/presence store.
//!
//! The store owns two record shapes: append-only signal rows keyed by room
//! and filtered by recipient, and one presence row per (room, peer). The
//! signaling client only inserts, upserts and subscribes; it never owns the
//! schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use duet_shared::protocol::{PresenceRecord, SignalRecord};
use duet_shared::types::{PeerId, RoomId};

/// Substrings that mark an otherwise opaque transport error as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "fetch",
    "unavailable",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Record not found")]
    NotFound,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether the failed operation may succeed if replayed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network(_) | StoreError::Timeout => true,
            StoreError::Rejected { status, .. } => *status == 408 || *status >= 502,
            StoreError::Other(message) => {
                let message = message.to_lowercase();
                TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
            }
            _ => false,
        }
    }
}

/// A change delivered to a room subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A newly persisted signal addressed to the subscriber.
    Signal(SignalRecord),
    /// A presence row in the room was created or changed.
    Presence(PresenceRecord),
}

/// An open room subscription.
#[derive(Debug)]
pub struct StoreSubscription {
    pub id: Uuid,
    pub events: mpsc::Receiver<StoreEvent>,
}

#[async_trait]
pub trait SignalStore: Send + Sync + 'static {
    /// Open a room-scoped channel delivering signals addressed to `user` and
    /// presence changes for `room`.
    async fn subscribe(&self, room: &RoomId, user: &PeerId)
        -> Result<StoreSubscription, StoreError>;

    /// Close a subscription opened by [`SignalStore::subscribe`].
    async fn unsubscribe(&self, subscription_id: Uuid) -> Result<(), StoreError>;

    /// Append a signal row.
    async fn insert_signal(&self, record: &SignalRecord) -> Result<(), StoreError>;

    /// Create or update the presence row for `(record.room_id, record.user_id)`.
    async fn upsert_presence(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    /// Refresh the heartbeat timestamp of an existing presence row.
    async fn touch_heartbeat(
        &self,
        room: &RoomId,
        user: &PeerId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
