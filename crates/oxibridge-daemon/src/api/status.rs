//! Session status endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use oxibridge_core::SessionStatus;

use crate::state::SharedState;

/// Creates the status router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(get_status))
}

/// Latest session snapshot: phase, failure counters, last sample.
pub async fn get_status(State(state): State<SharedState>) -> Json<SessionStatus> {
    Json(state.status())
}
