//! Bounded hand-off between the session and the sink.
//!
//! A slow sink write must not stall notification polling, so samples go
//! through a bounded queue to a single writer task. When the queue is full
//! the session waits: samples are never dropped to make room. Samples the
//! sink rejects are logged and dropped by the writer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::sink::{write_with_retry, MetricSink, RetryPolicy};
use crate::types::MetricSample;

/// Totals reported once the writer has drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Samples stored by the sink.
    pub written: u64,
    /// Samples given up on after a sink error.
    pub dropped: u64,
}

/// Handle to the writer task.
#[derive(Debug)]
pub struct Forwarder {
    tx: mpsc::Sender<MetricSample>,
    writer: JoinHandle<ForwarderStats>,
}

impl Forwarder {
    /// Spawn the writer task on the current runtime.
    ///
    /// `capacity` is clamped to at least one slot.
    #[must_use]
    pub fn spawn(
        sink: Arc<dyn MetricSink>,
        host_tag: String,
        retry: RetryPolicy,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(run_writer(sink, host_tag, retry, rx));
        Self { tx, writer }
    }

    /// Queue a sample, waiting for room if the queue is full.
    ///
    /// Returns `false` if the writer is gone and the sample was not queued.
    pub async fn forward(&self, sample: MetricSample) -> bool {
        if self.tx.send(sample).await.is_ok() {
            true
        } else {
            error!("Sink writer has stopped, sample lost");
            false
        }
    }

    /// Stop accepting samples, write out the queue and return the totals.
    pub async fn close(self) -> ForwarderStats {
        drop(self.tx);
        match self.writer.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Sink writer task failed");
                ForwarderStats::default()
            }
        }
    }
}

async fn run_writer(
    sink: Arc<dyn MetricSink>,
    host_tag: String,
    retry: RetryPolicy,
    mut rx: mpsc::Receiver<MetricSample>,
) -> ForwarderStats {
    let mut stats = ForwarderStats::default();

    while let Some(sample) = rx.recv().await {
        match write_with_retry(sink.as_ref(), &sample, &host_tag, retry).await {
            Ok(()) => stats.written += 1,
            Err(err) if err.is_retryable() => {
                stats.dropped += 1;
                warn!(
                    error = %err,
                    retries = retry.max_retries,
                    dropped = stats.dropped,
                    "Sink unavailable, dropping sample"
                );
            }
            Err(err) => {
                stats.dropped += 1;
                error!(error = %err, dropped = stats.dropped, "Sink rejected sample");
            }
        }
    }

    stats
}
