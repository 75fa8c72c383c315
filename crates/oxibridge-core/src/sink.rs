//! Metric sink abstraction.
//!
//! A sink stores one [`MetricSample`] at a time as a single point: a
//! measurement name, a `host` tag and one integer field per present reading.
//! Failures are split into retryable ones (network trouble, overloaded
//! server) and fatal ones (bad credentials, wrong bucket), and
//! [`write_with_retry`] applies a small fixed-delay retry budget to the
//! former.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::types::MetricSample;

/// Whether a sink failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// Transient: network error, timeout, server overload.
    Retryable,
    /// Permanent: authentication or configuration problem.
    Fatal,
}

/// A classified sink failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} sink error: {message}")]
pub struct SinkError {
    /// Retry classification.
    pub kind: SinkErrorKind,
    /// Description of the failure.
    pub message: String,
}

impl SinkError {
    /// A failure worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::Retryable,
            message: message.into(),
        }
    }

    /// A failure that will not go away on its own.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// Whether retrying may help.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == SinkErrorKind::Retryable
    }
}

/// Destination for decoded samples.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Store one sample tagged with `host_tag`.
    async fn write(&self, sample: &MetricSample, host_tag: &str) -> Result<(), SinkError>;

    /// Check reachability and credentials before streaming starts.
    async fn verify(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Fixed-delay retry budget for retryable sink failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Write a sample, retrying retryable failures per `policy`.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, or the first fatal
/// error immediately.
pub async fn write_with_retry(
    sink: &dyn MetricSink,
    sample: &MetricSample,
    host_tag: &str,
    policy: RetryPolicy,
) -> Result<(), SinkError> {
    let mut attempt = 0;
    loop {
        match sink.write(sample, host_tag).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                debug!(
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "Retrying sink write"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Render a sample as one line of InfluxDB line protocol.
///
/// Fields are written as integers; the timestamp is in nanoseconds.
#[must_use]
pub fn line_protocol(measurement: &str, host_tag: &str, sample: &MetricSample) -> String {
    let mut line = escape(measurement, &[',', ' ']);
    let _ = write!(line, ",host={}", escape(host_tag, &[',', ' ', '=']));

    let fields: Vec<String> = sample
        .fields()
        .into_iter()
        .map(|(name, value)| format!("{name}={value}i"))
        .collect();
    let _ = write!(line, " {}", fields.join(","));

    if let Some(nanos) = sample.observed_at.timestamp_nanos_opt() {
        let _ = write!(line, " {nanos}");
    }
    line
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
