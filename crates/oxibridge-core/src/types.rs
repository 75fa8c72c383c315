//! Shared types.
//!
//! Types used across modules and serialized by the daemon's status endpoint.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded set of readings.
///
/// SpO2 is always present because a frame too short to carry it fails to
/// decode. The remaining fields exist only when the frame reached their
/// offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Blood oxygen saturation, 0-100.
    pub spo2_percent: u8,

    /// Pulse rate in beats per minute.
    pub heart_rate_bpm: Option<u8>,

    /// Perfusion index as reported by the device.
    pub perfusion_index: Option<u8>,

    /// Motion indicator as reported by the device.
    pub movement: Option<u8>,

    /// Battery charge, 0-100.
    pub battery_percent: Option<u8>,

    /// When the notification carrying this sample was received.
    pub observed_at: DateTime<Utc>,
}

impl MetricSample {
    /// Present fields as `(sink field name, value)` pairs.
    ///
    /// Names match the series already stored by earlier deployments.
    #[must_use]
    pub fn fields(&self) -> Vec<(&'static str, i64)> {
        [
            ("spo2", Some(self.spo2_percent)),
            ("bpm", self.heart_rate_bpm),
            ("battery", self.battery_percent),
            ("movement", self.movement),
            ("pi", self.perfusion_index),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, i64::from(v))))
        .collect()
    }
}

/// How the activity monitor judged one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Worn, calibrated, valid readings.
    Productive,
    /// Liveness indicator reads zero.
    NotWorn,
    /// Worn, but SpO2 and pulse are still zero.
    Calibrating,
    /// Undecodable frame.
    Malformed,
}

impl Classification {
    /// Whether this notification should be forwarded to the sink.
    #[must_use]
    pub const fn is_productive(self) -> bool {
        matches!(self, Self::Productive)
    }
}

/// Lifecycle phase of the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No link; waiting out a reconnect delay or about to connect.
    #[default]
    Disconnected,
    /// Establishing the link.
    Connecting,
    /// Locating handles and arming notifications.
    Handshaking,
    /// Receiving notifications.
    Streaming,
    /// Tearing down after prolonged inactivity.
    Draining,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricSample {
        MetricSample {
            spo2_percent: 98,
            heart_rate_bpm: Some(72),
            perfusion_index: None,
            movement: None,
            battery_percent: None,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_fields_skip_absent_values() {
        assert_eq!(sample().fields(), vec![("spo2", 98), ("bpm", 72)]);
    }

    #[test]
    fn test_fields_keep_sink_order() {
        let s = MetricSample {
            battery_percent: Some(80),
            movement: Some(1),
            perfusion_index: Some(12),
            ..sample()
        };
        let names: Vec<_> = s.fields().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["spo2", "bpm", "battery", "movement", "pi"]);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&SessionPhase::Handshaking).unwrap();
        assert_eq!(json, "\"handshaking\"");
        assert_eq!(SessionPhase::Draining.to_string(), "draining");
    }

    #[test]
    fn test_only_productive_is_forwarded() {
        assert!(Classification::Productive.is_productive());
        assert!(!Classification::NotWorn.is_productive());
        assert!(!Classification::Calibrating.is_productive());
        assert!(!Classification::Malformed.is_productive());
    }
}
