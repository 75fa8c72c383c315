//! Read-only view of the session for observers.
//!
//! The session is the only writer. Everyone else holds a
//! [`StatusReceiver`] and sees the latest snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{Classification, MetricSample, SessionPhase};

/// Receiving half handed to observers.
pub type StatusReceiver = watch::Receiver<SessionStatus>;

/// Snapshot of the session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Current lifecycle phase.
    pub phase: SessionPhase,

    /// Connect or handshake failures since the last successful start.
    pub consecutive_failures: u32,

    /// Delay the next connect failure will wait, in milliseconds.
    pub current_backoff_ms: u64,

    /// Unproductive cycles in the current stream.
    pub unproductive_count: u32,

    /// Samples handed to the sink since startup.
    pub samples_forwarded: u64,

    /// Verdict for the most recent notification.
    pub last_classification: Option<Classification>,

    /// Most recent productive sample.
    pub last_sample: Option<MetricSample>,

    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            consecutive_failures: 0,
            current_backoff_ms: 0,
            unproductive_count: 0,
            samples_forwarded: 0,
            last_classification: None,
            last_sample: None,
            updated_at: Utc::now(),
        }
    }
}

/// Create a status channel seeded with the default snapshot.
#[must_use]
pub fn channel() -> (watch::Sender<SessionStatus>, StatusReceiver) {
    watch::channel(SessionStatus::default())
}
