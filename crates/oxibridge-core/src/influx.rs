//! InfluxDB v2 sink.
//!
//! Writes go to `/api/v2/write` as line protocol with nanosecond precision.
//! Startup verification looks the bucket up through `/api/v2/buckets`, which
//! exercises both reachability and the token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::sink::{line_protocol, MetricSink, SinkError};
use crate::types::MetricSample;

/// Connection parameters for an InfluxDB v2 server.
#[derive(Debug, Clone)]
pub struct InfluxSettings {
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    /// API token.
    pub token: String,
    /// Organization name.
    pub org: String,
    /// Target bucket.
    pub bucket: String,
    /// Measurement name for every point.
    pub measurement: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// [`MetricSink`] writing to InfluxDB v2 over HTTP.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    buckets_url: Url,
    token: String,
    measurement: String,
}

impl InfluxSink {
    /// Build a sink from connection settings.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`SinkError`] if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(settings: &InfluxSettings) -> Result<Self, SinkError> {
        let mut base = Url::parse(&settings.url)
            .map_err(|e| SinkError::fatal(format!("invalid sink URL '{}': {e}", settings.url)))?;
        // Keep any path prefix when joining the API routes.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut write_url = base
            .join("api/v2/write")
            .map_err(|e| SinkError::fatal(e.to_string()))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &settings.org)
            .append_pair("bucket", &settings.bucket)
            .append_pair("precision", "ns");

        let mut buckets_url = base
            .join("api/v2/buckets")
            .map_err(|e| SinkError::fatal(e.to_string()))?;
        buckets_url
            .query_pairs_mut()
            .append_pair("org", &settings.org)
            .append_pair("name", &settings.bucket);

        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| SinkError::fatal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            write_url,
            buckets_url,
            token: settings.token.clone(),
            measurement: settings.measurement.clone(),
        })
    }

    /// Endpoint that receives line protocol.
    #[must_use]
    pub const fn write_url(&self) -> &Url {
        &self.write_url
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.token)
    }
}

#[async_trait]
impl MetricSink for InfluxSink {
    async fn write(&self, sample: &MetricSample, host_tag: &str) -> Result<(), SinkError> {
        let body = line_protocol(&self.measurement, host_tag, sample);

        let response = self
            .client
            .post(self.write_url.clone())
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            debug!(%status, "Sample written");
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(classify_status(status, &detail))
    }

    async fn verify(&self) -> Result<(), SinkError> {
        let response = self
            .client
            .get(self.buckets_url.clone())
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &detail));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SinkError::retryable(format!("unreadable bucket listing: {e}")))?;
        let found = body
            .get("buckets")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|buckets| !buckets.is_empty());
        if found {
            Ok(())
        } else {
            Err(SinkError::fatal("bucket not found"))
        }
    }
}

fn classify_transport(err: reqwest::Error) -> SinkError {
    if err.is_builder() {
        SinkError::fatal(err.to_string())
    } else {
        SinkError::retryable(err.to_string())
    }
}

/// Map an HTTP error status to a sink error.
#[must_use]
pub fn classify_status(status: StatusCode, detail: &str) -> SinkError {
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", detail.trim())
    };
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        SinkError::retryable(message)
    } else {
        SinkError::fatal(message)
    }
}
