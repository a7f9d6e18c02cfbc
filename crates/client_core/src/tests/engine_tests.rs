use std::{
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};

use shared::protocol::InboundFrame;

use super::*;
use crate::{
    config::{Backoff, ReconnectPolicy},
    tests_support::{envelope, eventually, peer, FakeBackend, FakeConnector},
};

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(30),
        connect_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_millis(200),
        reconnect: ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            backoff: Backoff::Fixed,
        },
        ..EngineConfig::default()
    }
}

fn engine_with(
    backend: &Arc<FakeBackend>,
    connector: &Arc<FakeConnector>,
) -> Arc<SyncEngine> {
    SyncEngine::new_with_dependencies(
        test_config(),
        Arc::clone(backend) as Arc<dyn PresenceBackend>,
        Arc::clone(connector) as Arc<dyn ChannelConnector>,
    )
}

#[tokio::test]
async fn alice_sees_bob_online_and_unread_then_marks_read() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let engine = engine_with(&backend, &connector);

    engine.initialize(peer("alice")).await.expect("initialize");
    assert_eq!(engine.connection_state(), ConnectionState::Connected);

    connector.push(&InboundFrame::PeerOnline {
        peer_id: peer("bob"),
    });
    eventually("bob pushed online", || engine.presence.fresh(&peer("bob")).is_some()).await;
    assert!(engine.is_online(&peer("bob")).await);
    assert_eq!(backend.presence_calls.load(Ordering::SeqCst), 0);

    connector.push(&InboundFrame::NewMessage(envelope("m1", "bob", "alice", 1)));
    eventually("m1 counted", || engine.get_unread_count(&peer("bob")) == 1).await;
    assert_eq!(engine.get_total_unread(), 1);

    engine.mark_as_read(&peer("bob")).await;
    assert_eq!(engine.get_unread_count(&peer("bob")), 0);
    assert_eq!(engine.get_total_unread(), 0);
    assert_eq!(
        *backend.mark_read_calls.lock().unwrap(),
        vec![(peer("alice"), peer("bob"))]
    );
}

#[tokio::test]
async fn mark_as_read_publishes_before_backend_call_and_keeps_zero_on_failure() {
    let backend = FakeBackend::new();
    backend.fail_mark_read.store(true, Ordering::SeqCst);
    let connector = FakeConnector::new();
    let engine = engine_with(&backend, &connector);
    engine.initialize(peer("alice")).await.expect("initialize");
    engine.ledger.set_count(&peer("bob"), 3);

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let calls = Arc::clone(&backend);
    let _subscription = engine.subscribe(Box::new(move |event: &SyncEvent| {
        if let SyncEvent::UnreadUpdated { count: 0, .. } = event {
            sink.lock()
                .unwrap()
                .push(calls.mark_read_calls.lock().unwrap().len());
        }
    }));

    engine.mark_as_read(&peer("bob")).await;

    assert_eq!(*observed.lock().unwrap(), vec![0], "fact precedes the POST");
    assert_eq!(backend.mark_read_calls.lock().unwrap().len(), 1);
    assert_eq!(engine.get_unread_count(&peer("bob")), 0);
}

#[tokio::test]
async fn mark_as_read_does_not_wait_for_connect_seeding() {
    let backend = FakeBackend::new();
    *backend.unread_delay.lock().unwrap() = Duration::from_millis(150);
    *backend.online_list_delay.lock().unwrap() = Duration::from_millis(150);
    let connector = FakeConnector::new();
    let engine = engine_with(&backend, &connector);

    let starting = Arc::clone(&engine);
    let init = tokio::spawn(async move { starting.initialize(peer("alice")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = tokio::time::Instant::now();
    engine.mark_as_read(&peer("bob")).await;
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "mark_as_read blocked for {:?}",
        started.elapsed()
    );
    assert_eq!(
        *backend.mark_read_calls.lock().unwrap(),
        vec![(peer("alice"), peer("bob"))]
    );

    init.await.expect("join").expect("initialize");
}

#[tokio::test]
async fn disconnect_during_connect_leaves_no_link_behind() {
    let backend = FakeBackend::new();
    *backend.unread_delay.lock().unwrap() = Duration::from_millis(100);
    let connector = FakeConnector::new();
    let engine = engine_with(&backend, &connector);

    let starting = Arc::clone(&engine);
    let init = tokio::spawn(async move { starting.initialize(peer("alice")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.disconnect().await;
    init.await.expect("join").expect("initialize");

    assert_eq!(engine.identity().await, None);
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn hanging_connect_counts_as_failed_attempt() {
    let backend = FakeBackend::new();
    backend.set_unread(&[("bob", 4)]);
    let connector = FakeConnector::hanging();
    let engine = SyncEngine::new_with_dependencies(
        EngineConfig {
            connect_timeout: Duration::from_millis(30),
            ..test_config()
        },
        Arc::clone(&backend) as Arc<dyn PresenceBackend>,
        Arc::clone(&connector) as Arc<dyn ChannelConnector>,
    );
    let mut events = engine.subscribe_events();

    let result = tokio::time::timeout(Duration::from_secs(1), engine.initialize(peer("alice")))
        .await
        .expect("initialize must not hang");
    result.expect("initialize");

    loop {
        match events.recv().await.expect("event stream") {
            SyncEvent::ReconnectExhausted { attempts } => {
                assert_eq!(attempts, 2);
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(connector.attempts(), 3);
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);

    eventually("poll reconciled", || engine.get_total_unread() == 4).await;
}

#[tokio::test]
async fn polling_alone_converges_when_channel_never_connects() {
    let backend = FakeBackend::new();
    backend.set_unread(&[("bob", 2), ("carol", 3)]);
    let connector = FakeConnector::refusing();
    let engine = engine_with(&backend, &connector);

    engine.initialize(peer("alice")).await.expect("initialize");
    assert_ne!(engine.connection_state(), ConnectionState::Connected);

    eventually("poll reconciled", || engine.get_total_unread() == 5).await;
    assert_eq!(engine.get_unread_count(&peer("carol")), 3);
}

#[tokio::test]
async fn message_seen_by_push_and_poll_counts_once() {
    let backend = FakeBackend::new();
    backend.fail_unread.store(true, Ordering::SeqCst);
    let connector = FakeConnector::new();
    let engine = engine_with(&backend, &connector);
    engine.initialize(peer("alice")).await.expect("initialize");

    let message = envelope("m1", "bob", "alice", 1);
    connector.push(&InboundFrame::NewMessage(message.clone()));
    eventually("pushed message counted", || engine.get_unread_count(&peer("bob")) == 1).await;

    backend.messages.lock().unwrap().push(message);
    connector.refuse.store(true, Ordering::SeqCst);
    connector.drop_link("network change");

    eventually("poll ran while disconnected", || {
        backend.message_calls.load(Ordering::SeqCst) >= 1
    })
    .await;
    eventually("poll cursor advanced", || engine.polling.cursor().is_some()).await;
    assert_eq!(engine.get_unread_count(&peer("bob")), 1);
}

#[tokio::test]
async fn healthy_channel_suppresses_polling() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let engine = engine_with(&backend, &connector);
    engine.initialize(peer("alice")).await.expect("initialize");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.message_calls.load(Ordering::SeqCst), 0);
    assert_eq!(backend.unread_calls.load(Ordering::SeqCst), 1, "connect seed only");
}

#[tokio::test]
async fn empty_identity_is_rejected() {
    let engine = engine_with(&FakeBackend::new(), &FakeConnector::new());
    assert!(matches!(
        engine.initialize(peer("  ")).await,
        Err(SyncError::InvalidIdentity(_))
    ));
    assert_eq!(engine.identity().await, None);
}

#[tokio::test]
async fn initialize_is_idempotent_per_identity() {
    let connector = FakeConnector::new();
    let engine = engine_with(&FakeBackend::new(), &connector);

    engine.initialize(peer("alice")).await.expect("initialize");
    engine.initialize(peer("alice")).await.expect("initialize again");

    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn disconnect_cancels_timers_and_clears_state() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::refusing();
    let engine = engine_with(&backend, &connector);
    engine.initialize(peer("alice")).await.expect("initialize");
    engine.ledger.set_count(&peer("bob"), 4);
    engine.presence.record(&peer("bob"), true);

    engine.disconnect().await;

    assert_eq!(engine.identity().await, None);
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
    assert_eq!(engine.get_total_unread(), 0);
    assert_eq!(engine.presence.entry(&peer("bob")), None);
    assert_eq!(backend.announcements_of(PresenceAnnouncement::Offline), 1);

    let polls = backend.message_calls.load(Ordering::SeqCst);
    let attempts = connector.attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.message_calls.load(Ordering::SeqCst), polls);
    assert_eq!(connector.attempts(), attempts);
}

#[tokio::test]
async fn switching_identity_closes_previous_session() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::new();
    let engine = engine_with(&backend, &connector);

    engine.initialize(peer("alice")).await.expect("alice");
    engine.ledger.set_count(&peer("bob"), 2);
    engine.initialize(peer("carol")).await.expect("carol");

    assert_eq!(engine.identity().await, Some(peer("carol")));
    assert_eq!(connector.last_identity(), Some(peer("carol")));
    assert_eq!(engine.get_total_unread(), 0);
    assert_eq!(
        *backend.announcements.lock().unwrap(),
        vec![
            (peer("alice"), PresenceAnnouncement::Online),
            (peer("alice"), PresenceAnnouncement::Offline),
            (peer("carol"), PresenceAnnouncement::Online),
        ]
    );
}

#[tokio::test]
async fn send_message_surfaces_not_connected() {
    let engine = engine_with(&FakeBackend::new(), &FakeConnector::refusing());
    engine.initialize(peer("alice")).await.expect("initialize");

    assert_eq!(
        engine.send_message(peer("bob"), "hello").await,
        Err(SyncError::NotConnected)
    );
}

#[tokio::test]
async fn retry_connection_recovers_after_exhaustion() {
    let backend = FakeBackend::new();
    let connector = FakeConnector::refusing();
    let engine = engine_with(&backend, &connector);
    let mut events = engine.subscribe_events();
    engine.initialize(peer("alice")).await.expect("initialize");

    loop {
        match events.recv().await.expect("event stream") {
            SyncEvent::ReconnectExhausted { attempts } => {
                assert_eq!(attempts, 2);
                break;
            }
            _ => continue,
        }
    }

    connector.refuse.store(false, Ordering::SeqCst);
    engine.retry_connection().await.expect("retry");
    assert_eq!(engine.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn retry_without_session_is_not_connected() {
    let engine = engine_with(&FakeBackend::new(), &FakeConnector::new());
    assert_eq!(engine.retry_connection().await, Err(SyncError::NotConnected));
}

#[tokio::test]
async fn usable_through_the_trait_object() {
    let connector = FakeConnector::new();
    let engine = engine_with(&FakeBackend::new(), &connector);
    let handle: Box<dyn SyncHandle> = Box::new(Arc::clone(&engine));

    let mut state = handle.watch_connection_state();
    handle.initialize(peer("alice")).await.expect("initialize");
    assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

    handle
        .send_typing(peer("bob"), true)
        .await
        .expect("typing");
    let sent = handle
        .send_message(peer("bob"), "hi bob")
        .await
        .expect("send");
    assert_eq!(sent.from, peer("alice"));

    handle.disconnect().await;
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
}

#[test]
fn new_rejects_unusable_server_url() {
    let config = EngineConfig::with_server_url("ftp://example.com");
    assert!(SyncEngine::new(config).is_err());
}
