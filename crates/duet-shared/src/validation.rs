//! Payload and constraint validators.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_SIGNAL_SIZE;
use crate::error::ValidationError;
use crate::protocol::SignalMessage;

/// Check a signal's shape and serialized size before it is sent or after it
/// is received.
pub fn validate_signal(message: &SignalMessage) -> Result<(), ValidationError> {
    if message.from.trim().is_empty() {
        return Err(ValidationError::EmptyField("from"));
    }
    if message.to.trim().is_empty() {
        return Err(ValidationError::EmptyField("to"));
    }

    let size = message.encoded_len()?;
    if size > MAX_SIGNAL_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_SIGNAL_SIZE,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Media constraints
// ---------------------------------------------------------------------------

/// Capture constraints in the shape of `getUserMedia` arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    #[serde(default)]
    pub audio: TrackRequest,
    #[serde(default)]
    pub video: TrackRequest,
}

/// Either a plain on/off flag or a set of track constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackRequest {
    Flag(bool),
    Constraints(TrackConstraints),
}

impl Default for TrackRequest {
    fn default() -> Self {
        TrackRequest::Flag(false)
    }
}

impl TrackRequest {
    pub fn is_requested(&self) -> bool {
        !matches!(self, TrackRequest::Flag(false))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackConstraints {
    pub width: Option<NumericConstraint>,
    pub height: Option<NumericConstraint>,
    pub frame_rate: Option<NumericConstraint>,
    pub sample_rate: Option<NumericConstraint>,
    pub channel_count: Option<NumericConstraint>,
    pub device_id: Option<String>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
}

/// A bare number or a `{ min, max, ideal, exact }` range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericConstraint {
    Value(f64),
    Range(ConstrainRange),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstrainRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub ideal: Option<f64>,
    pub exact: Option<f64>,
}

impl MediaConstraints {
    /// Parse constraints from untyped JSON and validate them.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ValidationError> {
        let constraints: Self =
            serde_json::from_value(value.clone()).map_err(|e| ValidationError::InvalidConstraint {
                field: "constraints".into(),
                reason: e.to_string(),
            })?;
        constraints.validate()?;
        Ok(constraints)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.audio.is_requested() && !self.video.is_requested() {
            return Err(ValidationError::NoMediaRequested);
        }
        if let TrackRequest::Constraints(track) = &self.audio {
            track.validate("audio")?;
        }
        if let TrackRequest::Constraints(track) = &self.video {
            track.validate("video")?;
        }
        Ok(())
    }
}

impl TrackConstraints {
    fn validate(&self, kind: &str) -> Result<(), ValidationError> {
        let fields = [
            ("width", &self.width),
            ("height", &self.height),
            ("frameRate", &self.frame_rate),
            ("sampleRate", &self.sample_rate),
            ("channelCount", &self.channel_count),
        ];
        for (name, constraint) in fields {
            if let Some(constraint) = constraint {
                constraint.validate(&format!("{kind}.{name}"))?;
            }
        }
        Ok(())
    }
}

impl NumericConstraint {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidConstraint {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        let check = |v: f64| {
            if !v.is_finite() {
                Err(invalid("not a finite number"))
            } else if v <= 0.0 {
                Err(invalid("must be positive"))
            } else {
                Ok(())
            }
        };

        match self {
            NumericConstraint::Value(v) => check(*v),
            NumericConstraint::Range(range) => {
                let values = [range.min, range.max, range.ideal, range.exact];
                if values.iter().all(Option::is_none) {
                    return Err(invalid("empty range"));
                }
                for v in values.into_iter().flatten() {
                    check(v)?;
                }
                if let (Some(min), Some(max)) = (range.min, range.max) {
                    if min > max {
                        return Err(invalid("min exceeds max"));
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalType;
    use serde_json::json;

    #[test]
    fn test_valid_signal_passes() {
        let msg = SignalMessage::new(SignalType::Offer, "alice", "bob", json!({"sdp": "v=0"}));
        assert!(validate_signal(&msg).is_ok());
    }

    #[test]
    fn test_oversized_signal_rejected() {
        let big = "x".repeat(MAX_SIGNAL_SIZE);
        let msg = SignalMessage::new(SignalType::Offer, "alice", "bob", json!(big));
        assert!(matches!(
            validate_signal(&msg),
            Err(ValidationError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_blank_recipient_rejected() {
        let msg = SignalMessage::new(SignalType::Bye, "alice", "  ", json!(null));
        assert_eq!(validate_signal(&msg), Err(ValidationError::EmptyField("to")));
    }

    #[test]
    fn test_constraints_require_some_media() {
        let result = MediaConstraints::from_json(&json!({ "audio": false, "video": false }));
        assert_eq!(result, Err(ValidationError::NoMediaRequested));
        assert_eq!(
            MediaConstraints::from_json(&json!({})),
            Err(ValidationError::NoMediaRequested)
        );
    }

    #[test]
    fn test_constraints_accept_flags_and_ranges() {
        let constraints = MediaConstraints::from_json(&json!({
            "audio": { "echoCancellation": true, "sampleRate": 48000 },
            "video": { "width": { "min": 640, "ideal": 1280 }, "frameRate": 30 }
        }))
        .unwrap();
        assert!(constraints.audio.is_requested());
        assert!(constraints.video.is_requested());

        assert!(MediaConstraints::from_json(&json!({ "audio": true })).is_ok());
    }

    #[test]
    fn test_constraints_reject_malformed_numbers() {
        let inverted = json!({ "video": { "width": { "min": 1920, "max": 640 } } });
        assert!(matches!(
            MediaConstraints::from_json(&inverted),
            Err(ValidationError::InvalidConstraint { .. })
        ));

        let negative = json!({ "video": { "frameRate": -5 } });
        assert!(MediaConstraints::from_json(&negative).is_err());

        let textual = json!({ "video": { "height": "tall" } });
        assert!(MediaConstraints::from_json(&textual).is_err());
    }
}
