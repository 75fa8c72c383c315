//! The session state machine.
//!
//! A [`Session`] owns the [`Link`], the reconnect backoff and the activity
//! monitor, and drives them through
//! `Disconnected → Connecting → Handshaking → Streaming (→ Draining)` until
//! its shutdown token is cancelled. Productive samples leave through a
//! [`Forwarder`] so sink latency never delays polling.
//!
//! Three ways back to `Disconnected`, each with its own delay:
//!
//! - connect or handshake failure: exponential backoff
//! - peer dropped the link, or one error kept repeating: `reconnect_delay`
//! - device idle for the inactivity timeout: `inactivity_resume_delay`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::{ActivityMonitor, Observation};
use crate::backoff::BackoffState;
use crate::config::{Config, RearmPolicy};
use crate::forwarder::{Forwarder, ForwarderStats};
use crate::link::{AddressKind, GattHandles, HandshakeError, Link, LinkError};
use crate::sink::{MetricSink, RetryPolicy};
use crate::status::{self, SessionStatus, StatusReceiver};
use crate::types::SessionPhase;

/// Everything the session needs to know, flattened from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Device address.
    pub address: String,
    /// Device addressing mode.
    pub address_kind: AddressKind,
    /// Interval between reads.
    pub read_period: Duration,
    /// Notification wait per cycle.
    pub poll_timeout: Duration,
    /// Bound on one connect attempt, and separately on each handshake.
    pub connect_timeout: Duration,
    /// Delay after a transport loss or an error streak.
    pub reconnect_delay: Duration,
    /// First connect-failure delay.
    pub backoff_floor: Duration,
    /// Largest connect-failure delay.
    pub backoff_ceiling: Duration,
    /// Unproductive time before letting go of the device.
    pub inactivity_timeout: Duration,
    /// Delay after an inactivity disconnect.
    pub inactivity_resume_delay: Duration,
    /// Identical streaming errors tolerated in a row.
    pub max_repeated_errors: u32,
    /// Handshake repetition policy.
    pub rearm: RearmPolicy,
    /// Forwarder queue size.
    pub queue_capacity: usize,
    /// Value of the `host` tag on every sample.
    pub host_tag: String,
    /// Sink retry budget.
    pub retry: RetryPolicy,
}

impl SessionSettings {
    /// Extract session settings from the application configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let s = &config.session;
        Self {
            address: config.device.address.clone(),
            address_kind: config.device.address_type,
            read_period: s.read_period(),
            poll_timeout: s.poll_timeout(),
            connect_timeout: s.connect_timeout(),
            reconnect_delay: s.reconnect_delay(),
            backoff_floor: s.backoff_floor(),
            backoff_ceiling: s.backoff_ceiling(),
            inactivity_timeout: s.inactivity_timeout(),
            inactivity_resume_delay: s.inactivity_resume_delay(),
            max_repeated_errors: s.max_repeated_errors,
            rearm: s.rearm,
            queue_capacity: s.queue_capacity,
            host_tag: config.sink.host_tag.clone(),
            retry: config.sink.retry_policy(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened over the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Connect attempts made.
    pub connect_attempts: u32,
    /// Times streaming started.
    pub streams_started: u32,
    /// Times the peer dropped the link while streaming.
    pub transport_losses: u32,
    /// Times the device was released for inactivity.
    pub inactivity_disconnects: u32,
    /// Samples handed to the forwarder.
    pub samples_forwarded: u64,
    /// Sink-side totals.
    pub forwarder: ForwarderStats,
}

/// Where to go after a connection attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Shutdown,
    Reconnect(Duration),
}

/// Counts back-to-back occurrences of the same error.
#[derive(Debug, Default)]
struct ErrorStreak {
    last: Option<String>,
    count: u32,
}

impl ErrorStreak {
    fn record(&mut self, error: String) -> u32 {
        if self.last.as_ref() == Some(&error) {
            self.count = self.count.saturating_add(1);
        } else {
            self.last = Some(error);
            self.count = 1;
        }
        self.count
    }

    fn clear(&mut self) {
        self.last = None;
        self.count = 0;
    }
}

/// One oximeter, one link, one loop.
pub struct Session<L: Link> {
    link: L,
    sink: Arc<dyn MetricSink>,
    settings: SessionSettings,
    phase: SessionPhase,
    backoff: BackoffState,
    monitor: ActivityMonitor,
    status: watch::Sender<SessionStatus>,
    summary: SessionSummary,
}

impl<L: Link> Session<L> {
    /// Create a session. Nothing happens until [`Session::run`].
    pub fn new(link: L, sink: Arc<dyn MetricSink>, settings: SessionSettings) -> Self {
        let (status, _) = status::channel();
        Self {
            backoff: BackoffState::new(settings.backoff_floor, settings.backoff_ceiling),
            monitor: ActivityMonitor::new(settings.read_period, settings.inactivity_timeout),
            link,
            sink,
            settings,
            phase: SessionPhase::Disconnected,
            status,
            summary: SessionSummary::default(),
        }
    }

    /// A receiver for status snapshots.
    #[must_use]
    pub fn subscribe(&self) -> StatusReceiver {
        self.status.subscribe()
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// On the way out the link is disconnected and queued samples are
    /// written before the summary is returned.
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionSummary {
        info!(
            address = %self.settings.address,
            kind = %self.settings.address_kind,
            read_period_secs = self.settings.read_period.as_secs_f64(),
            inactivity_timeout_secs = self.settings.inactivity_timeout.as_secs(),
            inactivity_cycles = self.monitor.threshold_cycles(),
            rearm = ?self.settings.rearm,
            "Session starting"
        );

        let forwarder = Forwarder::spawn(
            Arc::clone(&self.sink),
            self.settings.host_tag.clone(),
            self.settings.retry,
            self.settings.queue_capacity,
        );

        loop {
            let delay = match self.attempt(&forwarder, &shutdown).await {
                Next::Shutdown => break,
                Next::Reconnect(delay) => delay,
            };
            self.enter(SessionPhase::Disconnected);
            debug!(delay_ms = delay.as_millis(), "Waiting before reconnecting");
            if !pause(delay, &shutdown).await {
                break;
            }
        }

        info!("Shutdown requested, closing link");
        self.link.disconnect().await;
        self.enter(SessionPhase::Disconnected);

        self.summary.forwarder = forwarder.close().await;
        info!(
            connect_attempts = self.summary.connect_attempts,
            streams_started = self.summary.streams_started,
            samples_written = self.summary.forwarder.written,
            samples_dropped = self.summary.forwarder.dropped,
            "Session stopped"
        );
        self.summary
    }

    /// Connect, handshake and stream once.
    async fn attempt(&mut self, forwarder: &Forwarder, shutdown: &CancellationToken) -> Next {
        self.enter(SessionPhase::Connecting);
        self.summary.connect_attempts = self.summary.connect_attempts.saturating_add(1);

        let timeout = self.settings.connect_timeout;
        let connect = tokio::time::timeout(
            timeout,
            self.link
                .connect(&self.settings.address, self.settings.address_kind),
        );
        let connected = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Next::Shutdown,
            result = connect => result,
        };
        // A failed or abandoned connect may still have left BlueZ connected.
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.link.disconnect().await;
                return self.connect_failed(&e);
            }
            Err(_) => {
                self.link.disconnect().await;
                return self.connect_failed(&LinkError::Timeout {
                    operation: "connect",
                    after: timeout,
                });
            }
        }

        self.enter(SessionPhase::Handshaking);
        let handshake = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Next::Shutdown,
            result = self.handshake() => result,
        };
        match handshake {
            Ok(handles) => debug!(
                write = handles.write,
                notify = handles.notify,
                "Notifications armed"
            ),
            Err(e) => {
                self.link.disconnect().await;
                return self.connect_failed(&e);
            }
        }

        self.backoff.reset();
        self.monitor.reset();
        self.summary.streams_started = self.summary.streams_started.saturating_add(1);
        self.enter(SessionPhase::Streaming);

        self.stream(forwarder, shutdown).await
    }

    /// Handshake bounded by the connect timeout.
    async fn handshake(&mut self) -> Result<GattHandles, HandshakeError> {
        let timeout = self.settings.connect_timeout;
        tokio::time::timeout(timeout, self.link.perform_handshake())
            .await
            .unwrap_or_else(|_| {
                Err(HandshakeError::Link(LinkError::Timeout {
                    operation: "handshake",
                    after: timeout,
                }))
            })
    }

    fn connect_failed(&mut self, error: &dyn std::error::Error) -> Next {
        let delay = self.backoff.on_failure();
        warn!(
            error = %error,
            phase = %self.phase,
            consecutive_failures = self.backoff.consecutive_failures(),
            backoff_ms = delay.as_millis(),
            "Connection attempt failed"
        );
        self.publish();
        Next::Reconnect(delay)
    }

    async fn stream(&mut self, forwarder: &Forwarder, shutdown: &CancellationToken) -> Next {
        let started = Instant::now();
        let mut errors = ErrorStreak::default();

        loop {
            let polled = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Next::Shutdown,
                result = self.link.wait_for_notification(self.settings.poll_timeout) => result,
            };

            match polled {
                Ok(Some(raw)) => {
                    let observation = self.monitor.observe(&raw, Utc::now());
                    if observation.classification.is_productive() {
                        errors.clear();
                    }
                    if !self.record(observation, forwarder, shutdown).await {
                        return Next::Shutdown;
                    }
                }
                Ok(None) => {
                    self.monitor.observe_silence();
                    self.publish();
                }
                Err(LinkError::TransportLost) => return self.transport_lost().await,
                Err(e) => {
                    // A failed poll delivered nothing, same as silence.
                    self.monitor.observe_silence();
                    self.publish();
                    if let Some(next) = self.tolerate(&mut errors, &e).await {
                        return next;
                    }
                }
            }

            if self.monitor.should_force_disconnect() {
                return self.drain().await;
            }

            let wait = until_next_tick(started.elapsed(), self.settings.read_period);
            if !pause(wait, shutdown).await {
                return Next::Shutdown;
            }

            if self.settings.rearm == RearmPolicy::EveryCycle {
                let rearmed = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return Next::Shutdown,
                    result = self.handshake() => result,
                };
                match rearmed {
                    Ok(_) => {}
                    Err(HandshakeError::Link(LinkError::TransportLost)) => {
                        return self.transport_lost().await;
                    }
                    Err(e) => {
                        if let Some(next) = self.tolerate(&mut errors, &e).await {
                            return next;
                        }
                    }
                }
            }
        }
    }

    /// Publish an observation and queue its sample. Returns `false` if
    /// shutdown arrived while waiting for queue space.
    async fn record(
        &mut self,
        observation: Observation,
        forwarder: &Forwarder,
        shutdown: &CancellationToken,
    ) -> bool {
        let Observation {
            classification,
            sample,
        } = observation;

        self.status.send_modify(|s| {
            s.last_classification = Some(classification);
            if let Some(sample) = &sample {
                s.last_sample = Some(sample.clone());
            }
        });

        if let Some(sample) = sample {
            debug!(
                spo2 = sample.spo2_percent,
                bpm = sample.heart_rate_bpm,
                "Productive sample"
            );
            let queued = tokio::select! {
                biased;
                () = shutdown.cancelled() => return false,
                queued = forwarder.forward(sample) => queued,
            };
            if queued {
                self.summary.samples_forwarded = self.summary.samples_forwarded.saturating_add(1);
            }
        } else {
            debug!(
                ?classification,
                unproductive = self.monitor.state().consecutive_unproductive_count,
                "Unproductive notification"
            );
        }

        self.publish();
        true
    }

    /// Log a non-transport error and decide whether the streak is too long.
    async fn tolerate(
        &mut self,
        errors: &mut ErrorStreak,
        error: &(dyn std::error::Error + Send + Sync),
    ) -> Option<Next> {
        let repeated = errors.record(error.to_string());
        warn!(error = %error, repeated, "Error while streaming");
        if repeated < self.settings.max_repeated_errors {
            return None;
        }
        warn!(
            error = %error,
            repeated,
            "Same error keeps repeating, reconnecting"
        );
        self.link.disconnect().await;
        Some(Next::Reconnect(self.settings.reconnect_delay))
    }

    async fn transport_lost(&mut self) -> Next {
        self.summary.transport_losses = self.summary.transport_losses.saturating_add(1);
        info!(
            delay_ms = self.settings.reconnect_delay.as_millis(),
            "Device disconnected"
        );
        self.link.disconnect().await;
        Next::Reconnect(self.settings.reconnect_delay)
    }

    async fn drain(&mut self) -> Next {
        self.enter(SessionPhase::Draining);
        info!(
            unproductive = self.monitor.state().consecutive_unproductive_count,
            timeout_secs = self.settings.inactivity_timeout.as_secs(),
            resume_in_secs = self.settings.inactivity_resume_delay.as_secs(),
            "No productive data for the inactivity timeout, releasing device"
        );
        self.link.disconnect().await;
        self.summary.inactivity_disconnects = self.summary.inactivity_disconnects.saturating_add(1);
        Next::Reconnect(self.settings.inactivity_resume_delay)
    }

    fn enter(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            info!(
                from = %self.phase,
                to = %phase,
                consecutive_failures = self.backoff.consecutive_failures(),
                backoff_ms = self.backoff.current_delay().as_millis(),
                "Session phase changed"
            );
            self.phase = phase;
        }
        self.publish();
    }

    fn publish(&self) {
        let phase = self.phase;
        let failures = self.backoff.consecutive_failures();
        let backoff_ms = u64::try_from(self.backoff.current_delay().as_millis()).unwrap_or(u64::MAX);
        let unproductive = self.monitor.state().consecutive_unproductive_count;
        let forwarded = self.summary.samples_forwarded;

        self.status.send_modify(|s| {
            s.phase = phase;
            s.consecutive_failures = failures;
            s.current_backoff_ms = backoff_ms;
            s.unproductive_count = unproductive;
            s.samples_forwarded = forwarded;
            s.updated_at = Utc::now();
        });
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns `false` on shutdown.
async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Time from `elapsed` to the next multiple of `period`.
///
/// Measuring from the stream start keeps the read cadence from drifting by
/// however long each poll took.
fn until_next_tick(elapsed: Duration, period: Duration) -> Duration {
    let period_ns = period.as_nanos();
    if period_ns == 0 {
        return Duration::ZERO;
    }
    let into_period = elapsed.as_nanos() % period_ns;
    let remaining = period_ns - into_period;
    Duration::from_nanos(u64::try_from(remaining).unwrap_or(u64::MAX))
}
