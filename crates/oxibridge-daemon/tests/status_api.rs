//! Status surface over the full router.

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Utc;
use oxibridge_core::status;
use oxibridge_core::{Classification, MetricSample, SessionPhase, SessionStatus};
use oxibridge_daemon::api::create_router;
use oxibridge_daemon::state::AppState;
use serde_json::Value;

#[tokio::test]
async fn status_endpoint_returns_latest_snapshot() {
    let (tx, rx) = status::channel();
    let server = TestServer::new(create_router(AppState::new(rx))).unwrap();

    let initial: SessionStatus = server.get("/api/status").await.json();
    assert_eq!(initial.phase, SessionPhase::Disconnected);
    assert!(initial.last_sample.is_none());

    tx.send_modify(|s| {
        s.phase = SessionPhase::Streaming;
        s.samples_forwarded = 42;
        s.last_classification = Some(Classification::Productive);
        s.last_sample = Some(MetricSample {
            spo2_percent: 96,
            heart_rate_bpm: Some(58),
            perfusion_index: None,
            movement: None,
            battery_percent: Some(71),
            observed_at: Utc::now(),
        });
    });

    let body: Value = server.get("/api/status").await.json();
    assert_eq!(body["phase"], "streaming");
    assert_eq!(body["samples_forwarded"], 42);
    assert_eq!(body["last_classification"], "productive");
    assert_eq!(body["last_sample"]["spo2_percent"], 96);
    assert_eq!(body["last_sample"]["battery_percent"], 71);
}

#[tokio::test]
async fn health_endpoint_is_always_ok() {
    let (tx, rx) = status::channel();
    let server = TestServer::new(create_router(AppState::new(rx))).unwrap();

    tx.send_modify(|s| {
        s.phase = SessionPhase::Connecting;
        s.consecutive_failures = 3;
    });

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["phase"], "connecting");
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let (_tx, rx) = status::channel();
    let server = TestServer::new(create_router(AppState::new(rx))).unwrap();

    server
        .get("/api/unknown")
        .expect_failure()
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn snapshot_survives_session_end() {
    let (tx, rx) = status::channel();
    let server = TestServer::new(create_router(AppState::new(rx))).unwrap();

    tx.send_modify(|s| s.samples_forwarded = 7);
    drop(tx);

    let body: Value = server.get("/api/status").await.json();
    assert_eq!(body["samples_forwarded"], 7);
}
