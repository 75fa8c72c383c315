//! Notification frame decoding.
//!
//! The oximeter pushes a fixed-layout notification every read period. Only a
//! handful of byte offsets carry metrics; everything else is vendor framing we
//! do not interpret. Frames arrive from the radio untrusted, so every access
//! goes through a length-checked lookup.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::MetricSample;

/// Byte offsets inside a notification frame.
pub mod offsets {
    /// Blood oxygen saturation, percent.
    pub const SPO2: usize = 7;
    /// Pulse rate, beats per minute.
    pub const HEART_RATE: usize = 8;
    /// Battery charge, percent.
    pub const BATTERY: usize = 14;
    /// Motion indicator.
    pub const MOVEMENT: usize = 16;
    /// Perfusion index.
    pub const PERFUSION_INDEX: usize = 17;
    /// Zero while the sensor has no finger signal.
    pub const LIVENESS: usize = 18;
}

/// Smallest frame that still carries an SpO2 reading.
pub const MIN_FRAME_LEN: usize = offsets::SPO2 + 1;

/// Upper bound for the percentage fields.
const MAX_PERCENT: u8 = 100;

/// Errors produced while decoding a notification frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The frame is too short to contain even the SpO2 byte.
    #[error("frame too short: {len} bytes, need at least {MIN_FRAME_LEN}")]
    TooShort {
        /// Length of the received frame.
        len: usize,
    },

    /// A percentage field holds a value that cannot be a percentage.
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// Raw byte value.
        value: u8,
    },
}

/// Bytes received in a single notification event.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct RawFrame(Vec<u8>);

impl RawFrame {
    /// Wrap a received payload.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Number of bytes in the frame.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame carries no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Byte at `offset`, or `None` if the frame is shorter than that.
    #[must_use]
    pub fn byte(&self, offset: usize) -> Option<u8> {
        self.0.get(offset).copied()
    }

    /// The not-worn indicator, if the frame is long enough to carry it.
    #[must_use]
    pub fn liveness_indicator(&self) -> Option<u8> {
        self.byte(offsets::LIVENESS)
    }

    /// Lowercase hex rendering, used for trace-level logging only.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for RawFrame {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

// Payloads stay out of Debug output so they never leak into normal logs.
impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame").field("len", &self.0.len()).finish()
    }
}

/// Decode a frame, stamping the sample with the current time.
///
/// # Errors
///
/// See [`decode_at`].
pub fn decode(raw: &RawFrame) -> Result<MetricSample, DecodeError> {
    decode_at(raw, Utc::now())
}

/// Decode a frame into a [`MetricSample`] observed at `observed_at`.
///
/// Fields are filled progressively: each one is present only when the frame
/// reaches its offset. Values are taken verbatim, without scaling.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for frames under [`MIN_FRAME_LEN`]
/// bytes and [`DecodeError::OutOfRange`] when SpO2 or battery exceed 100.
pub fn decode_at(raw: &RawFrame, observed_at: DateTime<Utc>) -> Result<MetricSample, DecodeError> {
    let spo2_percent = raw
        .byte(offsets::SPO2)
        .ok_or(DecodeError::TooShort { len: raw.len() })?;
    let battery_percent = raw.byte(offsets::BATTERY);

    check_percent("spo2", Some(spo2_percent))?;
    check_percent("battery", battery_percent)?;

    Ok(MetricSample {
        spo2_percent,
        heart_rate_bpm: raw.byte(offsets::HEART_RATE),
        perfusion_index: raw.byte(offsets::PERFUSION_INDEX),
        movement: raw.byte(offsets::MOVEMENT),
        battery_percent,
        observed_at,
    })
}

fn check_percent(field: &'static str, value: Option<u8>) -> Result<(), DecodeError> {
    match value {
        Some(value) if value > MAX_PERCENT => Err(DecodeError::OutOfRange { field, value }),
        _ => Ok(()),
    }
}
