//! Reconnect timing of the session, driven on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{assert_gap, not_worn_frame, settings, worn_frame, Poll, RecordingSink, ScriptedLink};
use oxibridge_core::{HandshakeError, LinkError, Session, SessionPhase};
use tokio_util::sync::CancellationToken;

fn connect_refused() -> LinkError {
    LinkError::ConnectFailed {
        address: "DE:C7:8C:52:03:93".into(),
        message: "le-connection-abort-by-local".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn connect_failures_back_off_exponentially() {
    let shutdown = CancellationToken::new();
    let link = ScriptedLink::new(shutdown.clone())
        .connect_err(connect_refused())
        .connect_err(connect_refused())
        .connect_err(connect_refused());
    let log = link.log();
    let sink = Arc::new(RecordingSink::default());

    let session = Session::new(
        link,
        sink,
        settings(Duration::from_secs(1), Duration::from_secs(1)),
    );
    let summary = session.run(shutdown).await;

    let log = log.lock().unwrap();
    assert_eq!(log.connects.len(), 4, "three failures and the final attempt");
    assert_gap(log.connects[1], log.connects[0], Duration::from_secs(1));
    assert_gap(log.connects[2], log.connects[1], Duration::from_secs(2));
    assert_gap(log.connects[3], log.connects[2], Duration::from_secs(4));
    // Every refused attempt is torn down before backing off, then shutdown.
    assert_eq!(log.disconnects.len(), 4);
    assert_gap(log.disconnects[0], log.connects[0], Duration::ZERO);
    assert_eq!(summary.connect_attempts, 4);
    assert_eq!(summary.streams_started, 0);
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped_at_the_ceiling() {
    let shutdown = CancellationToken::new();
    let mut link = ScriptedLink::new(shutdown.clone());
    for _ in 0..4 {
        link = link.connect_err(connect_refused());
    }
    let log = link.log();

    let mut s = settings(Duration::from_secs(1), Duration::from_secs(1));
    s.backoff_ceiling = Duration::from_secs(3);
    Session::new(link, Arc::new(RecordingSink::default()), s)
        .run(shutdown)
        .await;

    let log = log.lock().unwrap();
    assert_gap(log.connects[2], log.connects[1], Duration::from_secs(2));
    assert_gap(log.connects[3], log.connects[2], Duration::from_secs(3));
    assert_gap(log.connects[4], log.connects[3], Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn transport_loss_uses_fixed_reconnect_delay() {
    let shutdown = CancellationToken::new();
    let link = ScriptedLink::new(shutdown.clone())
        .connect_ok()
        .poll(Poll::Frame(worn_frame(97, 64)))
        .poll(Poll::Lost);
    let log = link.log();
    let sink = Arc::new(RecordingSink::default());

    // A reconnect delay distinct from the backoff floor.
    let session = Session::new(
        link,
        sink.clone(),
        settings(Duration::from_secs(5), Duration::from_secs(1)),
    );
    let summary = session.run(shutdown).await;

    let log = log.lock().unwrap();
    assert_eq!(log.connects.len(), 2);
    assert_gap(log.connects[1], log.disconnects[0], Duration::from_secs(5));
    assert_eq!(summary.transport_losses, 1);
    assert_eq!(sink.spo2_values(), vec![97]);
}

#[tokio::test(start_paused = true)]
async fn inactivity_releases_device_and_waits_resume_delay() {
    let shutdown = CancellationToken::new();
    let link = ScriptedLink::new(shutdown.clone())
        .connect_ok()
        .polls(&Poll::Frame(not_worn_frame()), 150);
    let log = link.log();
    let sink = Arc::new(RecordingSink::default());

    let session = Session::new(
        link,
        sink.clone(),
        settings(Duration::from_secs(1), Duration::from_secs(1)),
    );
    let status = session.subscribe();
    let summary = session.run(shutdown).await;

    let log = log.lock().unwrap();
    assert_eq!(log.polls, 150, "released right after the 150th frame");
    assert_eq!(log.disconnects.len(), 2, "inactivity release and shutdown");
    // 150 reads two seconds apart, the first at the start of the stream.
    assert_gap(log.disconnects[0], log.connects[0], Duration::from_secs(298));
    assert_gap(log.connects[1], log.disconnects[0], Duration::from_secs(130));
    assert_eq!(summary.inactivity_disconnects, 1);
    assert!(sink.spo2_values().is_empty());
    assert_eq!(status.borrow().phase, SessionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn silence_counts_towards_inactivity() {
    let shutdown = CancellationToken::new();
    let link = ScriptedLink::new(shutdown.clone())
        .connect_ok()
        .polls(&Poll::Silence, 3);
    let log = link.log();

    let mut s = settings(Duration::from_secs(1), Duration::from_secs(1));
    s.inactivity_timeout = Duration::from_secs(6);
    let summary = Session::new(link, Arc::new(RecordingSink::default()), s)
        .run(shutdown)
        .await;

    assert_eq!(summary.inactivity_disconnects, 1);
    assert_eq!(log.lock().unwrap().polls, 3);
}

#[tokio::test(start_paused = true)]
async fn failing_polls_count_towards_inactivity() {
    let shutdown = CancellationToken::new();
    let mut link = ScriptedLink::new(shutdown.clone()).connect_ok();
    // Alternating errors never form a streak, so only inactivity can end this.
    for i in 0..150 {
        let message = if i % 2 == 0 {
            "org.bluez.Error.Failed"
        } else {
            "org.bluez.Error.InProgress"
        };
        link = link.poll(Poll::Fail(LinkError::Bluetooth(message.into())));
    }
    let log = link.log();

    let session = Session::new(
        link,
        Arc::new(RecordingSink::default()),
        settings(Duration::from_secs(1), Duration::from_secs(1)),
    );
    let summary = session.run(shutdown).await;

    let log = log.lock().unwrap();
    assert_eq!(log.polls, 150);
    assert_eq!(summary.inactivity_disconnects, 1);
    assert_gap(log.disconnects[0], log.connects[0], Duration::from_secs(298));
    assert_gap(log.connects[1], log.disconnects[0], Duration::from_secs(130));
}

#[tokio::test(start_paused = true)]
async fn stalled_handshake_is_bounded_by_connect_timeout() {
    let shutdown = CancellationToken::new();
    let link = ScriptedLink::new(shutdown.clone())
        .connect_ok()
        .stall_handshake()
        .connect_ok();
    let log = link.log();

    let mut s = settings(Duration::from_secs(5), Duration::from_secs(1));
    s.connect_timeout = Duration::from_secs(10);
    let summary = Session::new(link, Arc::new(RecordingSink::default()), s)
        .run(shutdown)
        .await;

    let log = log.lock().unwrap();
    assert_eq!(log.connects.len(), 2);
    assert_gap(log.disconnects[0], log.connects[0], Duration::from_secs(10));
    // Counted as a connect failure: the backoff floor, not the reconnect delay.
    assert_gap(log.connects[1], log.disconnects[0], Duration::from_secs(1));
    assert_eq!(summary.streams_started, 1);
}

#[tokio::test(start_paused = true)]
async fn handshake_failure_counts_as_connect_failure() {
    let shutdown = CancellationToken::new();
    let link = ScriptedLink::new(shutdown.clone())
        .connect_ok()
        .handshake(Err(HandshakeError::ServiceNotFound {
            service: "14839ac4-7d7e-415c-9a42-167340cf2339".into(),
        }))
        .connect_ok()
        .handshake(Err(HandshakeError::HandlesNotFound {
            write_found: true,
            notify_found: false,
        }));
    let log = link.log();

    let session = Session::new(
        link,
        Arc::new(RecordingSink::default()),
        settings(Duration::from_secs(5), Duration::from_secs(1)),
    );
    let status = session.subscribe();
    let summary = session.run(shutdown).await;

    let log = log.lock().unwrap();
    assert_eq!(log.connects.len(), 3);
    // Backoff, not the reconnect delay.
    assert_gap(log.connects[1], log.connects[0], Duration::from_secs(1));
    assert_gap(log.connects[2], log.connects[1], Duration::from_secs(2));
    // The half-open link is closed after each failed handshake.
    assert_gap(log.disconnects[0], log.connects[0], Duration::ZERO);
    assert_eq!(summary.streams_started, 0);
    assert_eq!(status.borrow().consecutive_failures, 2);
    assert_eq!(status.borrow().current_backoff_ms, 4_000);
}

#[tokio::test(start_paused = true)]
async fn streaming_resets_backoff_to_floor() {
    let shutdown = CancellationToken::new();
    let link = ScriptedLink::new(shutdown.clone())
        .connect_err(connect_refused())
        .connect_err(connect_refused())
        .connect_ok()
        .poll(Poll::Lost)
        .connect_err(connect_refused());
    let log = link.log();

    let session = Session::new(
        link,
        Arc::new(RecordingSink::default()),
        settings(Duration::from_secs(5), Duration::from_secs(1)),
    );
    let summary = session.run(shutdown).await;

    let log = log.lock().unwrap();
    assert_eq!(log.connects.len(), 5);
    assert_gap(log.connects[2], log.connects[1], Duration::from_secs(2));
    assert_gap(log.connects[3], log.connects[2], Duration::from_secs(5));
    assert_gap(log.connects[4], log.connects[3], Duration::from_secs(1));
    assert_eq!(summary.streams_started, 1);
}

#[tokio::test(start_paused = true)]
async fn connect_attempt_is_bounded_by_timeout() {
    struct HangingLink {
        inner: ScriptedLink,
        hang_first: bool,
    }

    #[async_trait::async_trait]
    impl oxibridge_core::Link for HangingLink {
        async fn connect(
            &mut self,
            address: &str,
            kind: oxibridge_core::AddressKind,
        ) -> Result<(), LinkError> {
            if std::mem::take(&mut self.hang_first) {
                let _ = self.inner.connect(address, kind).await;
                std::future::pending::<()>().await;
            }
            self.inner.connect(address, kind).await
        }

        async fn perform_handshake(
            &mut self,
        ) -> Result<oxibridge_core::GattHandles, HandshakeError> {
            self.inner.perform_handshake().await
        }

        async fn wait_for_notification(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<oxibridge_core::RawFrame>, LinkError> {
            self.inner.wait_for_notification(timeout).await
        }

        async fn disconnect(&mut self) {
            self.inner.disconnect().await;
        }
    }

    let shutdown = CancellationToken::new();
    let inner = ScriptedLink::new(shutdown.clone()).connect_ok();
    let log = inner.log();
    let link = HangingLink {
        inner,
        hang_first: true,
    };

    let mut s = settings(Duration::from_secs(1), Duration::from_secs(1));
    s.connect_timeout = Duration::from_secs(10);
    let summary = Session::new(link, Arc::new(RecordingSink::default()), s)
        .run(shutdown)
        .await;

    let log = log.lock().unwrap();
    assert_eq!(log.connects.len(), 2);
    // Ten seconds of hanging, then the one second floor.
    assert_gap(log.connects[1], log.connects[0], Duration::from_secs(11));
    assert_eq!(summary.connect_attempts, 2);
}
