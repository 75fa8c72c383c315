//! HTTP status surface.
//!
//! Read-only endpoints over the session's status snapshots:
//! - `health` - liveness probe
//! - `status` - the full session snapshot

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::SharedState;

pub mod health;
pub mod status;

/// Creates the router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// └── /status            - Session status snapshot
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api", Router::new().nest("/status", status::router()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status endpoints on `addr` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(
    addr: SocketAddr,
    state: SharedState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Status server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Status server stopped");
    Ok(())
}
