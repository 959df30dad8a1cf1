//! End-to-end session lifecycle tests against a simulated conference
//! server, fake devices, and controllable transports.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{MockDevices, MockFactory, MockServer};
use confab_session_core::events::{BusMessage, TOPIC_TRANSPORT_STATS};
use confab_session_core::media::MediaKind;
use confab_session_core::quality::{QualityLevel, QualitySample};
use confab_session_core::session::{ReconnectConfig, SessionBuilder, SessionOrchestrator};
use confab_session_core::transport::{TransportConnectionState, TransportKind, TransportPoolConfig};
use confab_session_core::{ConnectionState, QualityProfile, SessionError};

fn build_session() -> (Arc<SessionOrchestrator>, Arc<MockServer>, Arc<MockFactory>) {
    build_session_with(|b| b)
}

fn build_session_with(
    configure: impl FnOnce(SessionBuilder) -> SessionBuilder,
) -> (Arc<SessionOrchestrator>, Arc<MockServer>, Arc<MockFactory>) {
    let (server, rx) = MockServer::start();
    let factory = Arc::new(MockFactory::default());
    let builder = SessionBuilder::new("meeting-1", "alice")
        .signaling(server.clone(), rx)
        .devices(Arc::new(MockDevices))
        .transport_factory(factory.clone());
    let session = configure(builder).build().unwrap();
    (session, server, factory)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn connect_establishes_session_and_produces_each_track() {
    let (session, server, factory) = build_session();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let t2 = Arc::clone(&transitions);
    session.on_state_change(move |new, old| {
        t2.lock().unwrap().push((new, old));
    });

    session.connect().await.unwrap();

    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(server.join_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.produce_calls.load(Ordering::SeqCst), 2);
    assert!(session.media().producer(MediaKind::Audio).is_some());
    assert!(session.media().producer(MediaKind::Video).is_some());
    assert_eq!(factory.created.lock().unwrap().len(), 2);

    let stats = session.stats();
    assert_eq!(stats.state, ConnectionState::Connected);
    assert_eq!(stats.producer_count, 2);
    assert_eq!(stats.pending_producers, 0);
    assert_eq!(stats.reconnect_attempts, 0);

    assert_eq!(
        transitions.lock().unwrap().as_slice(),
        [
            (ConnectionState::Connecting, ConnectionState::New),
            (ConnectionState::Connected, ConnectionState::Connecting),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn connect_twice_is_rejected() {
    let (session, _server, _factory) = build_session();
    session.connect().await.unwrap();
    let err = session.connect().await;
    assert!(matches!(err, Err(SessionError::InvalidState { .. })));
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn producers_present_at_join_are_consumed_exactly_once() {
    let (session, server, _factory) = build_session();
    server.announce_at_join("bob", "p1", MediaKind::Video);

    session.connect().await.unwrap();
    settle().await;

    assert_eq!(server.consume_calls.lock().unwrap().as_slice(), ["p1"]);
    let remote = session.media().remote_stream().unwrap();
    assert_eq!(remote.tracks.len(), 1);

    // A duplicate announcement for a producer we already consume is a no-op.
    server.push_new_producer("bob", "p1", MediaKind::Video);
    settle().await;
    assert_eq!(server.consume_calls.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn new_producer_pushes_are_consumed_and_reported() {
    let (session, server, _factory) = build_session();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let u2 = Arc::clone(&updates);
    session.on_streams_update(move |update| {
        u2.lock().unwrap().push(update.remote.is_some());
    });

    session.connect().await.unwrap();
    server.push_new_producer("bob", "p2", MediaKind::Audio);
    settle().await;

    assert_eq!(server.consume_calls.lock().unwrap().as_slice(), ["p2"]);
    assert!(session.media().remote_stream().is_some());
    assert!(updates.lock().unwrap().iter().any(|remote| *remote));
}

#[tokio::test(start_paused = true)]
async fn producers_arriving_mid_drain_are_consumed_in_order() {
    let (session, server, _factory) = build_session();
    server.announce_at_join("bob", "p1", MediaKind::Video);
    server.consume_delay_ms.store(100, Ordering::SeqCst);

    let connect = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.connect().await }
    });

    // Land a push while the first consume is still in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.push_new_producer("bob", "p2", MediaKind::Audio);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The in-flight consume finishes before the pushed producer is touched.
    assert_eq!(server.consume_calls.lock().unwrap().as_slice(), ["p1"]);

    connect.await.unwrap().unwrap();
    settle().await;
    assert_eq!(server.consume_calls.lock().unwrap().as_slice(), ["p1", "p2"]);
    let remote = session.media().remote_stream().unwrap();
    assert_eq!(remote.tracks.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn producer_closed_push_removes_the_consumer() {
    let (session, server, _factory) = build_session();
    server.announce_at_join("bob", "p1", MediaKind::Video);
    session.connect().await.unwrap();
    settle().await;
    assert!(session.media().remote_stream().is_some());

    server.push_notification(json!({
        "event": "producer-closed",
        "data": { "producer_id": "p1" },
    }));
    settle().await;
    assert!(session.media().remote_stream().is_none());
}

#[tokio::test(start_paused = true)]
async fn participant_disconnect_drops_all_their_consumers() {
    let (session, server, _factory) = build_session();
    server.announce_at_join("bob", "p1", MediaKind::Video);
    session.connect().await.unwrap();
    settle().await;

    server.push_notification(json!({
        "event": "participant-disconnected",
        "data": { "participant_id": "bob" },
    }));
    settle().await;
    assert!(session.media().remote_stream().is_none());
}

#[tokio::test(start_paused = true)]
async fn reconnect_exhaustion_fails_the_session_once() {
    let (session, server, _factory) = build_session_with(|b| {
        b.reconnect(ReconnectConfig {
            max_attempts: 2,
            initial_delay_ms: 10,
            max_delay_ms: 40,
        })
    });
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e2 = Arc::clone(&errors);
    session.on_error(move |error| {
        e2.lock().unwrap().push(error);
    });

    session.connect().await.unwrap();
    server.fail_reconnects.store(true, Ordering::SeqCst);

    let err = session.attempt_reconnect().await;
    assert!(matches!(
        err,
        Err(SessionError::MaxReconnectAttemptsExceeded { attempts: 2 })
    ));
    assert_eq!(session.state(), ConnectionState::Failed);

    let ceiling_errors = errors
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SessionError::MaxReconnectAttemptsExceeded { .. }))
        .count();
    assert_eq!(ceiling_errors, 1);

    // The budget stays spent; no second sequence can start.
    let err = session.attempt_reconnect().await;
    assert!(matches!(err, Err(SessionError::InvalidState { .. })));
    assert_eq!(ceiling_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_restores_the_session() {
    let (session, server, factory) = build_session_with(|b| {
        b.reconnect(ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 40,
        })
    });
    session.connect().await.unwrap();

    session.attempt_reconnect().await.unwrap();

    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(server.reconnect_calls.load(Ordering::SeqCst), 1);
    // Both transports were rebuilt and both tracks re-produced.
    assert_eq!(factory.created.lock().unwrap().len(), 4);
    assert_eq!(server.produce_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn structural_reconnect_failure_surfaces_itself() {
    let (session, server, _factory) = build_session();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e2 = Arc::clone(&errors);
    session.on_error(move |error| {
        e2.lock().unwrap().push(error);
    });
    session.connect().await.unwrap();

    // A response the session cannot parse is not a budget problem.
    *server.join_body.lock().unwrap() = json!({ "bogus": true });
    let err = session.attempt_reconnect().await;
    assert!(matches!(err, Err(SessionError::MalformedPayload { .. })));
    assert_eq!(session.state(), ConnectionState::Failed);
    {
        let errors = errors.lock().unwrap();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SessionError::MalformedPayload { .. })));
        assert!(!errors
            .iter()
            .any(|e| matches!(e, SessionError::MaxReconnectAttemptsExceeded { .. })));
    }

    // The remaining attempts were left unspent; a later reconnect against
    // a healthy server still recovers.
    *server.join_body.lock().unwrap() = json!({
        "rtp_capabilities": { "codecs": [] },
        "participants": [],
    });
    session.attempt_reconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_escalates_into_session_recovery() {
    let (session, server, factory) = build_session_with(|b| {
        b.transport_config(TransportPoolConfig {
            stats_interval_ms: 60_000,
            disconnect_grace_ms: 10,
            max_ice_restarts: 0,
            idle_timeout_ms: 60_000,
        })
        .reconnect(ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 40,
        })
    });
    session.connect().await.unwrap();

    let producer_transport = factory.latest(TransportKind::Producer).unwrap();
    producer_transport.set_state(TransportConnectionState::Failed);
    tokio::time::sleep(Duration::from_secs(5)).await;

    // A zero restart budget escalates without trying ICE first.
    assert_eq!(producer_transport.restarts.load(Ordering::SeqCst), 0);
    assert!(server.reconnect_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn quality_changes_drive_profile_adaptation() {
    let (session, _server, _factory) = build_session();
    let levels = Arc::new(Mutex::new(Vec::new()));
    let l2 = Arc::clone(&levels);
    session.on_quality_change(move |new, old| {
        l2.lock().unwrap().push((new, old));
    });
    session.connect().await.unwrap();

    let good = QualitySample {
        rtt_ms: 50.0,
        packet_loss: 0.01,
        bitrate_kbps: 1200.0,
    };
    session.bus().emit(
        TOPIC_TRANSPORT_STATS,
        &BusMessage::TransportStats {
            kind: TransportKind::Producer,
            sample: good,
        },
    );
    settle().await;
    assert_eq!(session.quality_level(), QualityLevel::Excellent);

    // Bad samples drag the window averages down; the policy drops the
    // video profile to Low on Poor.
    let bad = QualitySample {
        rtt_ms: 900.0,
        packet_loss: 0.4,
        bitrate_kbps: 20.0,
    };
    for _ in 0..3 {
        session.bus().emit(
            TOPIC_TRANSPORT_STATS,
            &BusMessage::TransportStats {
                kind: TransportKind::Producer,
                sample: bad,
            },
        );
    }
    settle().await;

    assert_eq!(session.quality_level(), QualityLevel::Poor);
    assert_eq!(session.media().video_profile(), QualityProfile::Low);
    let levels = levels.lock().unwrap();
    assert_eq!(levels[0], (QualityLevel::Excellent, QualityLevel::Poor));
    assert!(levels.contains(&(QualityLevel::Poor, QualityLevel::Excellent)));
}

#[tokio::test(start_paused = true)]
async fn mute_toggles_producer_and_capture_together() {
    let (session, _server, _factory) = build_session();
    session.connect().await.unwrap();

    session.set_audio_enabled(false).await;
    let producer = session.media().producer(MediaKind::Audio).unwrap();
    assert!(producer.is_paused());
    assert!(!producer.track().is_enabled());

    session.set_audio_enabled(true).await;
    assert!(!producer.is_paused());
    assert!(producer.track().is_enabled());
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_terminal() {
    let (session, _server, factory) = build_session();
    session.connect().await.unwrap();
    let local = session.local_stream().await.unwrap();

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);

    // Every transport was closed exactly once and capture was released.
    for (_, transport) in factory.created.lock().unwrap().iter() {
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }
    for track in &local.tracks {
        assert!(track.has_ended());
    }

    // A closed session cannot be revived.
    assert!(session.connect().await.is_err());
    assert!(session.attempt_reconnect().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn disconnect_before_connect_is_terminal() {
    let (session, server, _factory) = build_session();

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);

    assert!(matches!(
        session.connect().await,
        Err(SessionError::InvalidState { .. })
    ));
    assert!(matches!(
        session.attempt_reconnect().await,
        Err(SessionError::InvalidState { .. })
    ));
    assert_eq!(server.join_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn meeting_ended_push_closes_the_session() {
    let (session, server, _factory) = build_session();
    session.connect().await.unwrap();

    server.push_notification(json!({ "event": "meeting-ended" }));
    settle().await;
    assert_eq!(session.state(), ConnectionState::Closed);
}
