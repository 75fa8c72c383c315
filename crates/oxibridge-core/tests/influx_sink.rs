//! InfluxDB sink against a fake HTTP server.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use oxibridge_core::{
    write_with_retry, InfluxSettings, InfluxSink, MetricSample, MetricSink, RetryPolicy,
    SinkErrorKind,
};
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(url: String) -> InfluxSettings {
    InfluxSettings {
        url,
        token: "s3cr3t".to_string(),
        org: "chromebook".to_string(),
        bucket: "health_data".to_string(),
        measurement: "Health".to_string(),
        timeout: Duration::from_secs(2),
    }
}

fn sample() -> MetricSample {
    MetricSample {
        spo2_percent: 97,
        heart_rate_bpm: Some(61),
        perfusion_index: Some(42),
        movement: Some(0),
        battery_percent: Some(88),
        observed_at: Utc.timestamp_opt(1_736_911_800, 0).unwrap(),
    }
}

#[tokio::test]
async fn write_posts_line_protocol_with_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .and(query_param("org", "chromebook"))
        .and(query_param("bucket", "health_data"))
        .and(query_param("precision", "ns"))
        .and(header("authorization", "Token s3cr3t"))
        .and(body_string(
            "Health,host=user spo2=97i,bpm=61i,battery=88i,movement=0i,pi=42i 1736911800000000000",
        ))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&settings(server.uri())).expect("sink");
    sink.write(&sample(), "user").await.expect("write accepted");
}

#[tokio::test]
async fn unauthorized_write_is_fatal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized access"))
        .expect(1)
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&settings(server.uri())).expect("sink");
    let err = write_with_retry(&sink, &sample(), "user", RetryPolicy::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, SinkErrorKind::Fatal);
    assert!(err.message.contains("unauthorized access"), "{err}");
}

#[tokio::test]
async fn unavailable_server_is_retried_then_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&settings(server.uri())).expect("sink");
    let policy = RetryPolicy {
        max_retries: 2,
        delay: Duration::from_millis(10),
    };
    let err = write_with_retry(&sink, &sample(), "user", policy)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "expected retryable, got {err:?}");
}

#[tokio::test]
async fn verify_finds_the_bucket() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/buckets"))
        .and(query_param("name", "health_data"))
        .and(header("authorization", "Token s3cr3t"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "buckets": [{ "name": "health_data" }] })),
        )
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&settings(server.uri())).expect("sink");
    assert!(sink.verify().await.is_ok());
}

#[tokio::test]
async fn verify_fails_fatally_for_missing_bucket_or_bad_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v2/buckets"))
        .and(header("authorization", "Token s3cr3t"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "buckets": [] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/buckets"))
        .and(header("authorization", "Token wrong"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let sink = InfluxSink::new(&settings(server.uri())).expect("sink");
    assert_eq!(sink.verify().await.unwrap_err().kind, SinkErrorKind::Fatal);

    let mut wrong = settings(server.uri());
    wrong.token = "wrong".to_string();
    let sink = InfluxSink::new(&wrong).expect("sink");
    assert_eq!(sink.verify().await.unwrap_err().kind, SinkErrorKind::Fatal);
}
