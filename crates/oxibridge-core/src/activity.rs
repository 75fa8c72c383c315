//! Liveness tracking for a streaming session.
//!
//! The oximeter keeps notifying while it is off-body or still settling on a
//! reading. Those notifications carry nothing worth storing, and keeping the
//! link up for them only burns the device's battery. The [`ActivityMonitor`]
//! classifies every notification, counts unproductive ones in a row and
//! tells the session when to let go of the device.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::frame::{self, DecodeError, RawFrame};
use crate::types::{Classification, MetricSample};

/// Liveness counters owned by the monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessState {
    /// Notifications (or silent poll ticks) since the last productive one.
    pub consecutive_unproductive_count: u32,

    /// When the last productive notification arrived.
    pub last_productive_at: Option<DateTime<Utc>>,
}

/// Result of observing one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Verdict for the notification.
    pub classification: Classification,

    /// The decoded sample, present only for [`Classification::Productive`].
    pub sample: Option<MetricSample>,
}

/// Classifies notifications and decides when the device is idle for too long.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    read_period: Duration,
    inactivity_timeout: Duration,
    state: LivenessState,
}

impl ActivityMonitor {
    /// Create a monitor that gives up after `inactivity_timeout` worth of
    /// unproductive cycles spaced `read_period` apart.
    #[must_use]
    pub fn new(read_period: Duration, inactivity_timeout: Duration) -> Self {
        Self {
            read_period,
            inactivity_timeout,
            state: LivenessState::default(),
        }
    }

    /// Current liveness counters.
    #[must_use]
    pub const fn state(&self) -> &LivenessState {
        &self.state
    }

    /// Number of unproductive cycles that trigger a forced disconnect.
    #[must_use]
    pub fn threshold_cycles(&self) -> u32 {
        if self.read_period.is_zero() {
            return u32::MAX;
        }
        let cycles = self
            .inactivity_timeout
            .as_nanos()
            .div_ceil(self.read_period.as_nanos());
        u32::try_from(cycles).unwrap_or(u32::MAX)
    }

    /// Classify a notification received at `now`.
    pub fn observe(&mut self, raw: &RawFrame, now: DateTime<Utc>) -> Observation {
        let (classification, sample) = classify(raw, now);

        if classification.is_productive() {
            self.state.consecutive_unproductive_count = 0;
            self.state.last_productive_at = Some(now);
        } else {
            self.bump();
        }

        trace!(
            len = raw.len(),
            frame = %raw.to_hex(),
            ?classification,
            "observed notification"
        );

        Observation {
            classification,
            sample,
        }
    }

    /// Account for a poll tick on which no notification arrived.
    pub fn observe_silence(&mut self) {
        self.bump();
        debug!(
            unproductive = self.state.consecutive_unproductive_count,
            "no notification this cycle"
        );
    }

    /// Whether the device has been unproductive for at least the inactivity
    /// timeout.
    #[must_use]
    pub fn should_force_disconnect(&self) -> bool {
        self.read_period
            .saturating_mul(self.state.consecutive_unproductive_count)
            >= self.inactivity_timeout
            && !self.read_period.is_zero()
    }

    /// Forget all counters, e.g. when a new streaming session starts.
    pub fn reset(&mut self) {
        self.state = LivenessState::default();
    }

    fn bump(&mut self) {
        self.state.consecutive_unproductive_count =
            self.state.consecutive_unproductive_count.saturating_add(1);
    }
}

fn classify(raw: &RawFrame, now: DateTime<Utc>) -> (Classification, Option<MetricSample>) {
    if raw.len() < frame::MIN_FRAME_LEN {
        return (Classification::Malformed, None);
    }
    // Off-body frames carry garbage in the metric bytes, so this comes first.
    if raw.liveness_indicator() == Some(0) {
        return (Classification::NotWorn, None);
    }

    // Zero readings mean the sensor is still settling, whatever the rest says.
    if raw.byte(frame::offsets::SPO2) == Some(0) && raw.byte(frame::offsets::HEART_RATE) == Some(0) {
        return (Classification::Calibrating, None);
    }

    match frame::decode_at(raw, now) {
        Err(DecodeError::TooShort { .. } | DecodeError::OutOfRange { .. }) => {
            (Classification::Malformed, None)
        }
        Ok(sample) => (Classification::Productive, Some(sample)),
    }
}
