//! Health check API endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use oxibridge_core::SessionPhase;
use serde::{Deserialize, Serialize};

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status. Always `ok` while the process serves requests.
    pub status: String,

    /// Service version from Cargo.toml.
    pub version: String,

    /// Current session phase.
    pub phase: SessionPhase,

    /// Seconds since startup.
    pub uptime_secs: u64,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        phase: state.status().phase,
        uptime_secs: state.uptime_secs(),
    })
}
