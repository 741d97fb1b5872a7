//! Link-quality report types.
//!
//! [`RawStat`] mirrors the W3C `RTCStats` dictionaries closely enough to be
//! filled from either a browser `getStats()` dump or webrtc-rs' serialized
//! report. [`StatsReport`] is the reduced, per-tick view handed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use duet_shared::error::ValidationError;

// ---------------------------------------------------------------------------
// Raw entries
// ---------------------------------------------------------------------------

/// One entry of a transport statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawStat {
    pub id: String,
    /// `inbound-rtp`, `outbound-rtp`, `candidate-pair`, `codec`, ...
    #[serde(rename = "type", alias = "stats_type")]
    pub stat_type: String,
    /// `audio` or `video` on RTP entries.
    pub kind: Option<String>,
    #[serde(alias = "bytes_sent")]
    pub bytes_sent: Option<u64>,
    #[serde(alias = "bytes_received")]
    pub bytes_received: Option<u64>,
    #[serde(alias = "packets_lost")]
    pub packets_lost: Option<i64>,
    /// Seconds.
    pub jitter: Option<f64>,
    /// Candidate-pair state; kept loose because producers disagree on its
    /// encoding.
    pub state: Option<serde_json::Value>,
    pub nominated: Option<bool>,
    /// Seconds.
    #[serde(alias = "current_round_trip_time")]
    pub current_round_trip_time: Option<f64>,
    #[serde(alias = "available_outgoing_bitrate")]
    pub available_outgoing_bitrate: Option<f64>,
    #[serde(alias = "frame_width")]
    pub frame_width: Option<u32>,
    #[serde(alias = "frame_height")]
    pub frame_height: Option<u32>,
    #[serde(alias = "frames_per_second")]
    pub frames_per_second: Option<f64>,
    #[serde(alias = "codec_id")]
    pub codec_id: Option<String>,
    #[serde(alias = "mime_type")]
    pub mime_type: Option<String>,
}

impl RawStat {
    pub fn is_type(&self, stat_type: &str) -> bool {
        self.stat_type == stat_type
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    /// Whether a candidate pair reports the `succeeded` state.
    pub fn succeeded(&self) -> bool {
        match &self.state {
            Some(serde_json::Value::String(state)) => state.eq_ignore_ascii_case("succeeded"),
            _ => false,
        }
    }

    /// Parse a JSON stats dump: either a map of id -> entry (optionally
    /// wrapped in a `reports` object) or an array of entries. Entries that
    /// do not parse are skipped.
    pub fn parse_report(value: serde_json::Value) -> Vec<RawStat> {
        let value = match value {
            serde_json::Value::Object(mut map) if map.contains_key("reports") => {
                map.remove("reports").unwrap_or_default()
            }
            other => other,
        };

        let entries: Vec<(Option<String>, serde_json::Value)> = match value {
            serde_json::Value::Object(map) => map.into_iter().map(|(id, v)| (Some(id), v)).collect(),
            serde_json::Value::Array(items) => items.into_iter().map(|v| (None, v)).collect(),
            _ => Vec::new(),
        };

        entries
            .into_iter()
            .filter_map(|(key, entry)| match serde_json::from_value::<RawStat>(entry) {
                Ok(mut stat) => {
                    if stat.id.is_empty() {
                        stat.id = key.unwrap_or_default();
                    }
                    Some(stat)
                }
                Err(e) => {
                    debug!(id = ?key, error = %e, "Skipping unparsable stats entry");
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Reduced report
// ---------------------------------------------------------------------------

/// Send/receive pair, bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Directional {
    pub send: f64,
    pub receive: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bitrate {
    pub video: Directional,
    pub audio: Directional,
}

impl Bitrate {
    pub fn total(&self) -> f64 {
        self.video.send + self.video.receive + self.audio.send + self.audio.receive
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bandwidth {
    pub available: f64,
    pub used: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub timestamp: DateTime<Utc>,
    pub bitrate: Bitrate,
    /// Cumulative lost packets summed over inbound streams.
    pub packet_loss: f64,
    /// Worst inbound jitter, seconds.
    pub jitter: f64,
    /// Milliseconds, from the succeeded candidate pair.
    pub rtt: f64,
    pub bandwidth: Bandwidth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

fn metric(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidMetric { field, value })
    }
}

impl StatsReport {
    /// Every numeric field finite and non-negative; optional video fields
    /// well-formed when present.
    pub fn validate(&self) -> Result<(), ValidationError> {
        metric("bitrate.video.send", self.bitrate.video.send)?;
        metric("bitrate.video.receive", self.bitrate.video.receive)?;
        metric("bitrate.audio.send", self.bitrate.audio.send)?;
        metric("bitrate.audio.receive", self.bitrate.audio.receive)?;
        metric("packetLoss", self.packet_loss)?;
        metric("jitter", self.jitter)?;
        metric("rtt", self.rtt)?;
        metric("bandwidth.available", self.bandwidth.available)?;
        metric("bandwidth.used", self.bandwidth.used)?;

        if let Some(resolution) = self.resolution {
            if resolution.width == 0 || resolution.height == 0 {
                return Err(ValidationError::InvalidConstraint {
                    field: "resolution".into(),
                    reason: format!("{}x{} is empty", resolution.width, resolution.height),
                });
            }
        }
        if let Some(fps) = self.fps {
            metric("fps", fps)?;
        }
        if let Some(codec) = &self.codec {
            if codec.trim().is_empty() {
                return Err(ValidationError::EmptyField("codec"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report() -> StatsReport {
        StatsReport {
            timestamp: Utc::now(),
            bitrate: Bitrate::default(),
            packet_loss: 0.0,
            jitter: 0.0,
            rtt: 0.0,
            bandwidth: Bandwidth::default(),
            resolution: None,
            fps: None,
            codec: None,
        }
    }

    #[test]
    fn test_validate_rejects_negative_and_nan() {
        assert!(report().validate().is_ok());

        let mut bad = report();
        bad.rtt = -1.0;
        assert_eq!(
            bad.validate(),
            Err(ValidationError::InvalidMetric {
                field: "rtt",
                value: -1.0
            })
        );

        let mut bad = report();
        bad.bitrate.audio.receive = f64::NAN;
        assert!(bad.validate().is_err());

        let mut bad = report();
        bad.resolution = Some(Resolution { width: 0, height: 720 });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_parse_browser_style_map() {
        let stats = RawStat::parse_report(json!({
            "IT01V": {
                "type": "inbound-rtp",
                "kind": "video",
                "bytesReceived": 1200,
                "packetsLost": 3,
                "jitter": 0.012,
                "frameWidth": 640,
                "frameHeight": 480
            },
            "CP1": {
                "type": "candidate-pair",
                "state": "succeeded",
                "currentRoundTripTime": 0.045
            }
        }));
        assert_eq!(stats.len(), 2);
        let inbound = stats.iter().find(|s| s.is_type("inbound-rtp")).unwrap();
        assert_eq!(inbound.id, "IT01V");
        assert_eq!(inbound.bytes_received, Some(1200));
        assert!(inbound.is_kind("video"));
        assert!(stats.iter().any(|s| s.succeeded()));
    }

    #[test]
    fn test_parse_snake_case_and_wrapped() {
        let stats = RawStat::parse_report(json!({
            "reports": {
                "out-1": { "stats_type": "outbound-rtp", "kind": "audio", "bytes_sent": 500 },
                "junk": 42
            }
        }));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].bytes_sent, Some(500));
        assert!(stats[0].is_type("outbound-rtp"));
    }
}
