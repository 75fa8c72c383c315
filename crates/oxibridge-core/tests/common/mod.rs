//! Scripted link and recording sink shared by the session tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use oxibridge_core::{
    AddressKind, GattHandles, HandshakeError, Link, LinkError, MetricSample, MetricSink,
    RawFrame, SessionSettings, SinkError,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One scripted answer to `wait_for_notification`.
#[derive(Debug, Clone)]
pub enum Poll {
    /// Deliver these bytes immediately.
    Frame(Vec<u8>),
    /// Let the poll time out.
    Silence,
    /// The peer disconnected.
    Lost,
    /// Some other transport failure.
    Fail(LinkError),
}

/// When each link call happened, in paused-clock time.
#[derive(Debug, Default)]
pub struct LinkLog {
    pub connects: Vec<Instant>,
    pub handshakes: Vec<Instant>,
    pub disconnects: Vec<Instant>,
    pub polls: usize,
}

/// A [`Link`] that plays back a script.
///
/// Connect answers come from `connects`. Handshakes succeed unless
/// `handshakes` holds a queued answer; the first `stalled_handshakes` never
/// answer at all. Once either the connect script or the
/// poll script is used up, the link cancels `shutdown` and blocks, which
/// ends the session.
pub struct ScriptedLink {
    connects: VecDeque<Result<(), LinkError>>,
    handshakes: VecDeque<Result<GattHandles, HandshakeError>>,
    stalled_handshakes: usize,
    polls: VecDeque<Poll>,
    shutdown: CancellationToken,
    log: Arc<Mutex<LinkLog>>,
}

pub const HANDLES: GattHandles = GattHandles {
    write: 0x0010,
    notify: 0x0013,
};

impl ScriptedLink {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            connects: VecDeque::new(),
            handshakes: VecDeque::new(),
            stalled_handshakes: 0,
            polls: VecDeque::new(),
            shutdown,
            log: Arc::default(),
        }
    }

    pub fn connect_ok(mut self) -> Self {
        self.connects.push_back(Ok(()));
        self
    }

    pub fn connect_err(mut self, err: LinkError) -> Self {
        self.connects.push_back(Err(err));
        self
    }

    pub fn handshake(mut self, result: Result<GattHandles, HandshakeError>) -> Self {
        self.handshakes.push_back(result);
        self
    }

    pub fn stall_handshake(mut self) -> Self {
        self.stalled_handshakes += 1;
        self
    }

    pub fn poll(mut self, poll: Poll) -> Self {
        self.polls.push_back(poll);
        self
    }

    pub fn polls(mut self, poll: &Poll, times: usize) -> Self {
        self.polls.extend(std::iter::repeat(poll.clone()).take(times));
        self
    }

    pub fn log(&self) -> Arc<Mutex<LinkLog>> {
        Arc::clone(&self.log)
    }

    async fn exhausted<T>(&self) -> T {
        self.shutdown.cancel();
        std::future::pending().await
    }
}

#[async_trait]
impl Link for ScriptedLink {
    async fn connect(&mut self, _address: &str, _kind: AddressKind) -> Result<(), LinkError> {
        self.log.lock().unwrap().connects.push(Instant::now());
        match self.connects.pop_front() {
            Some(result) => result,
            None => self.exhausted().await,
        }
    }

    async fn perform_handshake(&mut self) -> Result<GattHandles, HandshakeError> {
        self.log.lock().unwrap().handshakes.push(Instant::now());
        if self.stalled_handshakes > 0 {
            self.stalled_handshakes -= 1;
            std::future::pending::<()>().await;
        }
        self.handshakes.pop_front().unwrap_or(Ok(HANDLES))
    }

    async fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawFrame>, LinkError> {
        self.log.lock().unwrap().polls += 1;
        match self.polls.pop_front() {
            Some(Poll::Frame(bytes)) => Ok(Some(RawFrame::new(bytes))),
            Some(Poll::Silence) => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            Some(Poll::Lost) => Err(LinkError::TransportLost),
            Some(Poll::Fail(err)) => Err(err),
            None => self.exhausted().await,
        }
    }

    async fn disconnect(&mut self) {
        self.log.lock().unwrap().disconnects.push(Instant::now());
    }
}

/// A sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    pub samples: Mutex<Vec<(MetricSample, String)>>,
}

impl RecordingSink {
    pub fn spo2_values(&self) -> Vec<u8> {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .map(|(s, _)| s.spo2_percent)
            .collect()
    }
}

#[async_trait]
impl MetricSink for RecordingSink {
    async fn write(&self, sample: &MetricSample, host_tag: &str) -> Result<(), SinkError> {
        self.samples
            .lock()
            .unwrap()
            .push((sample.clone(), host_tag.to_string()));
        Ok(())
    }
}

/// A worn, productive 20-byte frame.
pub fn worn_frame(spo2: u8, bpm: u8) -> Vec<u8> {
    let mut bytes = vec![0u8; 20];
    bytes[7] = spo2;
    bytes[8] = bpm;
    bytes[14] = 90;
    bytes[16] = 0;
    bytes[17] = 35;
    bytes[18] = 1;
    bytes
}

/// A frame whose liveness byte says nobody is wearing the device.
pub fn not_worn_frame() -> Vec<u8> {
    let mut bytes = vec![0x7F; 20];
    bytes[18] = 0;
    bytes
}

/// Default settings with the given reconnect delay and backoff floor.
pub fn settings(reconnect_delay: Duration, backoff_floor: Duration) -> SessionSettings {
    SessionSettings {
        reconnect_delay,
        backoff_floor,
        ..SessionSettings::default()
    }
}

/// Assert two paused-clock instants are `expected` apart.
pub fn assert_gap(later: Instant, earlier: Instant, expected: Duration) {
    let gap = later - earlier;
    let diff = if gap > expected { gap - expected } else { expected - gap };
    assert!(
        diff <= Duration::from_millis(5),
        "expected a gap of {expected:?}, got {gap:?}"
    );
}
