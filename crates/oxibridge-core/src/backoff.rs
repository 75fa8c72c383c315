//! Exponential reconnect backoff.

use std::time::Duration;

/// Delay policy for repeated connect or handshake failures.
///
/// The delay handed out for a failure is the current one; the next failure
/// waits twice as long, capped at the ceiling. Entering streaming resets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    current_delay: Duration,
    floor: Duration,
    ceiling: Duration,
    consecutive_failures: u32,
}

impl BackoffState {
    /// Create a backoff starting at `floor` and never exceeding `ceiling`.
    ///
    /// A ceiling below the floor is raised to the floor.
    #[must_use]
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            current_delay: floor,
            floor,
            ceiling: ceiling.max(floor),
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = self.current_delay.saturating_mul(2).min(self.ceiling);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        delay
    }

    /// Back to the floor after a successful session start.
    pub fn reset(&mut self) {
        self.current_delay = self.floor;
        self.consecutive_failures = 0;
    }

    /// Delay the next failure will wait.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Failures since the last reset.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
