use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::types::{PresenceStatus, SignalType};
use crate::validation::validate_signal;

/// WebRTC signaling message exchanged between the two peers of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub from: String,
    pub to: String,
    /// Opaque payload (SDP, candidate, reason...)
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SignalMessage {
    pub fn new(
        kind: SignalType,
        from: impl Into<String>,
        to: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Serialized JSON size in bytes, as checked against the size limit.
    pub fn encoded_len(&self) -> Result<usize, ValidationError> {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .map_err(|e| ValidationError::Serialization(e.to_string()))
    }

    /// Build the persisted record for this message in `room_id`, with a fresh
    /// transport id.
    pub fn to_record(&self, room_id: &str) -> SignalRecord {
        SignalRecord {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            from_peer: self.from.clone(),
            to_peer: self.to.clone(),
            kind: self.kind.as_str().to_string(),
            payload: self.data.clone(),
            created_at: self.timestamp,
        }
    }

    /// Parse a persisted record back into a message. Records with an unknown
    /// kind or that fail validation are rejected.
    pub fn from_record(record: &SignalRecord) -> Result<Self, ValidationError> {
        let message = Self {
            kind: record.kind.parse()?,
            from: record.from_peer.clone(),
            to: record.to_peer.clone(),
            data: record.payload.clone(),
            timestamp: record.created_at,
        };
        validate_signal(&message)?;
        Ok(message)
    }
}

/// A peer joined or left the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: String,
    pub status: PresenceStatus,
    pub timestamp: DateTime<Utc>,
}

/// Signal row as stored by the signaling store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    /// Transport-level id, unique per delivery attempt
    pub id: Uuid,
    pub room_id: String,
    pub from_peer: String,
    pub to_peer: String,
    /// Wire name of the signal type; kept as text so foreign rows can be
    /// rejected on receipt rather than at deserialization
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Presence row, one per (room, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub room_id: String,
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// When `status` was last announced. Heartbeats leave it untouched, so a
    /// leave and rejoin shows up even when the status reads the same.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn to_event(&self) -> PresenceEvent {
        PresenceEvent {
            user_id: self.user_id.clone(),
            status: self.status,
            timestamp: self.last_heartbeat,
        }
    }
}
