//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use oxibridge_core::{SessionStatus, StatusReceiver};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    status: StatusReceiver,
    started_at: Instant,
}

/// Handle passed to every handler.
pub type SharedState = AppState;

impl AppState {
    /// Wrap the session's status receiver.
    #[must_use]
    pub fn new(status: StatusReceiver) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                status,
                started_at: Instant::now(),
            }),
        }
    }

    /// Latest session snapshot.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Seconds since the daemon started.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }
}
