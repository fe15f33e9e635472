//! Integration Tests for the Remote Transport
//!
//! Runs the complete transport over an in-process loopback medium:
//! - startup, embedded medium bootstrap and orderly shutdown
//! - inbound partitioning with per-recipient ordering
//! - supervision restarting a failed inbound stream
//! - fatal medium error escalation and startup failure cleanup

mod common;

use bytes::Bytes;
use common::*;
use remote_transport::supervisor::{StreamDescriptor, ORDINARY_STREAM_ID};
use remote_transport::medium::flags;
use remote_transport::{
    Fragment, Image, LifecycleState, MediumError, OfferOutcome, RemoteTransport, ShutdownStep,
    StepOutcome, TransportError,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    transport: RemoteTransport,
    medium: Arc<LoopbackMedium>,
    launcher: Arc<TempEmbeddedLauncher>,
    runtime: Arc<TestRuntime>,
    handler: Arc<RecordingHandler>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let medium = LoopbackMedium::new();
    let launcher = Arc::new(TempEmbeddedLauncher::default());
    let runtime = Arc::new(TestRuntime::default());
    let handler = Arc::new(RecordingHandler::default());

    let transport = RemoteTransport::new(
        test_settings(dir.path()),
        medium.clone(),
        Some(launcher.clone()),
        runtime.clone(),
        Arc::new(TestDecoder),
        handler.clone(),
    );

    Harness {
        transport,
        medium,
        launcher,
        runtime,
        handler,
        _dir: dir,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_flow_in_order_per_recipient() -> anyhow::Result<()> {
    let h = harness();
    h.transport.start().await?;

    let association = h.transport.associate(h.transport.local_endpoint().clone())?;
    for i in 0..50u32 {
        let recipient = (i % 5) as i32;
        let body = format!("m{i}");
        association.send(encode(recipient, 7, body.as_bytes())).await?;
    }
    association
        .send_control(encode(99, 7, b"handshake"))
        .await?;

    wait_until("all messages delivered", || h.handler.count() == 51).await;

    for recipient in 0..5 {
        let expected: Vec<Bytes> = (0..50u32)
            .filter(|i| (i % 5) as i32 == recipient)
            .map(|i| Bytes::from(format!("m{i}")))
            .collect();
        assert_eq!(h.handler.bodies_for(recipient), expected);
    }
    assert_eq!(h.handler.bodies_for(99), vec![Bytes::from_static(b"handshake")]);

    let report = h.transport.shutdown().await;
    assert!(report.is_clean());
    assert_eq!(h.launcher.closes.load(Ordering::Acquire), 1);
    assert_eq!(h.transport.lifecycle().state(), LifecycleState::Stopped);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_embedded_medium_receives_configuration() {
    let h = harness();
    assert_ok!(h.transport.start().await);

    {
        let launched = h.launcher.launched.lock();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].threading_mode, remote_transport::ThreadingMode::Shared);
        assert_eq!(launched[0].driver_timeout.as_millis(), 20_000);
    }
    let directory = h.transport.lifecycle().directory().unwrap();
    assert!(directory.exists());

    let report = h.transport.shutdown().await;
    assert_eq!(report.outcome(ShutdownStep::DeleteDirectory), Some(&StepOutcome::Done));
    assert!(!directory.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_inbound_stream_is_restarted() {
    let h = harness();
    assert_ok!(h.transport.start().await);
    let ordinary = StreamDescriptor::inbound(h.transport.kinds().ordinary);
    assert_eq!(h.transport.supervisor().launch_count(&ordinary), 1);

    assert_eq!(h.medium.close_subscriptions(ORDINARY_STREAM_ID), 1);
    wait_until("ordinary stream relaunched", || {
        h.transport.supervisor().launch_count(&ordinary) == 2
    })
    .await;
    assert_eq!(h.transport.supervisor().restart_count(&ordinary), 1);

    // the fresh pipeline delivers again
    let association = h.transport.associate(h.transport.local_endpoint().clone()).unwrap();
    association.send(encode(1, 2, b"after restart")).await.unwrap();
    wait_until("message after restart", || h.handler.count() == 1).await;

    h.transport.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_unavailable_reaches_inbound_streams() {
    let h = harness();
    assert_ok!(h.transport.start().await);
    assert_eq!(h.transport.lifecycle().registry().len(), 2);

    let local = h.transport.local_endpoint().clone();
    let inject = |fragment: Fragment| {
        assert_eq!(
            h.medium.inject(&local, ORDINARY_STREAM_ID, fragment),
            OfferOutcome::Accepted
        );
    };

    // session 3 leaves a half-received message behind; the marker on
    // session 4 shows the first fragment has been consumed
    inject(Fragment {
        session_id: 3,
        flags: flags::BEGIN,
        payload: encode(7, 1, b"partial-"),
    });
    inject(Fragment::unfragmented(4, encode(1, 1, b"marker")));
    wait_until("marker delivered", || h.handler.count() == 1).await;

    h.medium.handler().on_session_unavailable(&Image {
        session_id: 3,
        stream_id: ORDINARY_STREAM_ID,
        source_identity: "127.0.0.1:40123".into(),
    });

    // a released session has no partial buffer to complete
    inject(Fragment {
        session_id: 3,
        flags: flags::END,
        payload: Bytes::from_static(b"tail"),
    });
    inject(Fragment::unfragmented(3, encode(7, 1, b"whole")));
    wait_until("message after release", || h.handler.count() == 2).await;
    assert_eq!(h.handler.bodies_for(7), vec![Bytes::from_static(b"whole")]);

    h.transport.shutdown().await;
    assert!(h.transport.lifecycle().registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fatal_medium_error_terminates_runtime_once() {
    let h = harness();
    assert_ok!(h.transport.start().await);

    let handler = h.medium.handler();
    let first = handler.on_error(MediumError::ClientLivenessTimeout("no keepalive".into()));
    let second = handler.on_error(MediumError::DriverTimeout("driver gone".into()));
    assert!(matches!(first, Err(TransportError::Terminated { .. })));
    assert!(matches!(second, Err(TransportError::Terminated { .. })));
    assert_eq!(h.runtime.terminations.load(Ordering::Acquire), 1);

    // the runtime's own shutdown still completes
    let report = h.transport.shutdown().await;
    assert_eq!(report.outcome(ShutdownStep::CloseConnection), Some(&StepOutcome::Done));
    assert!(h.medium.connection_closed.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_startup_failure_leaves_nothing_running() {
    let h = harness();
    h.medium.fail_connect.store(true, Ordering::Release);

    let err = assert_err!(h.transport.start().await);
    assert!(matches!(err, TransportError::Startup { .. }));
    assert_eq!(h.transport.lifecycle().state(), LifecycleState::Stopped);
    assert_eq!(h.launcher.closes.load(Ordering::Acquire), 1);
    assert!(!h.transport.lifecycle().runner().is_running());
}

#[tokio::test]
async fn test_associate_requires_running_transport() {
    let h = harness();
    let err = h
        .transport
        .associate(h.transport.local_endpoint().clone())
        .unwrap_err();
    assert!(matches!(err, TransportError::NotRunning { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_shutdown_shares_one_report() {
    let h = harness();
    assert_ok!(h.transport.start().await);

    let (a, b) = tokio::join!(h.transport.shutdown(), h.transport.shutdown());
    assert_eq!(a, b);
    assert_eq!(h.launcher.closes.load(Ordering::Acquire), 1);
}
