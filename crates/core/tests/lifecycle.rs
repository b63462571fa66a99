//! Call start/teardown: idempotent hangup, namespace ownership, restarts

mod harness;

use async_trait::async_trait;
use camlink_core::codec::encode_description;
use camlink_core::testing::ScriptedMediaEngine;
use camlink_core::{
    CandidateLog, Error, LogEntry, MemoryStore, RendezvousStore, SessionCode, SessionDescription,
    SessionEvent, SignalingState, Slot, Subscription,
};
use harness::{code, init_logging, quiet_config, settle, TestPeer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Hangup
// ============================================================================

#[tokio::test]
async fn test_hangup_before_start_is_noop() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let mut peer = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));

    peer.session.hangup().await;
    peer.session.hangup().await;

    assert_eq!(peer.session.state(), SignalingState::Idle);
    assert!(peer.session.code().is_none());
    assert!(peer.drain_events().is_empty());
}

#[tokio::test]
async fn test_camera_hangup_twice_removes_namespace_once() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("482-913");

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();
    assert!(store.contains_namespace(&code));

    camera.session.hangup().await;
    assert_eq!(camera.session.state(), SignalingState::Closed);
    assert!(!store.contains_namespace(&code));

    camera.session.hangup().await;
    assert_eq!(camera.session.state(), SignalingState::Closed);

    let calls = camera.media.calls();
    assert_eq!(calls.stop_calls, 1);
    assert_eq!(calls.close_calls, 1);

    let closed = camera
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Closed))
        .count();
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn test_viewer_hangup_keeps_namespace() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("482-914");

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();
    let mut viewer = TestPeer::new(&store, ScriptedMediaEngine::new("viewer"));
    viewer.start_answerer(&code).await.unwrap();
    assert!(viewer.wait_for_state(SignalingState::Connected).await);

    viewer.session.hangup().await;
    assert_eq!(viewer.session.state(), SignalingState::Closed);
    assert!(viewer.media.is_closed());
    assert!(store.contains_namespace(&code));

    camera.session.hangup().await;
    assert!(!store.contains_namespace(&code));
}

#[tokio::test]
async fn test_hangup_tolerates_missing_namespace() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("482-915");

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();
    store.remove_namespace(&code).await.unwrap();

    camera.session.hangup().await;
    assert_eq!(camera.session.state(), SignalingState::Closed);
}

#[tokio::test]
async fn test_hangup_while_store_down_still_closes() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("482-916");

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();

    store.set_available(false);
    camera.session.hangup().await;
    assert_eq!(camera.session.state(), SignalingState::Closed);
    assert!(camera.media.is_closed());
    assert!(store.contains_namespace(&code));

    // Store back: the next hangup retries the removal only
    store.set_available(true);
    camera.session.hangup().await;
    assert!(!store.contains_namespace(&code));

    let calls = camera.media.calls();
    assert_eq!(calls.stop_calls, 1);
    assert_eq!(calls.close_calls, 1);
    let closed = camera
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Closed))
        .count();
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn test_restart_after_store_recovers_reuses_code() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("482-917");

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();

    store.set_available(false);
    camera.session.hangup().await;
    store.set_available(true);

    // Starting again finishes the pending removal before reserving
    let first_media = Arc::clone(&camera.media);
    camera.replace_media(ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();

    // The interrupted teardown resumed at the removal step
    let calls = first_media.calls();
    assert_eq!(calls.stop_calls, 1);
    assert_eq!(calls.close_calls, 1);
    assert_eq!(camera.session.state(), SignalingState::PeerDescriptionPending);
}

#[tokio::test]
async fn test_late_offer_after_hangup_is_dropped() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("123-321");

    let mut viewer = TestPeer::new(&store, ScriptedMediaEngine::new("viewer"));
    viewer.start_answerer(&code).await.unwrap();
    viewer.session.hangup().await;
    assert_eq!(store.active_watchers(&code), 0);

    store
        .publish(
            &code,
            Slot::Offer,
            encode_description(&SessionDescription::offer("v=0")).unwrap(),
        )
        .await
        .unwrap();
    settle().await;

    assert!(viewer.media.calls().applied.is_empty());
    assert!(store.slot_value(&code, Slot::Answer).is_none());
    assert_eq!(viewer.session.state(), SignalingState::Closed);
}

/// Store whose namespace removal takes a while
struct SlowRemoveStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl RendezvousStore for SlowRemoveStore {
    async fn create_namespace(&self, code: &SessionCode) -> camlink_core::Result<()> {
        self.inner.create_namespace(code).await
    }

    async fn publish(&self, code: &SessionCode, slot: Slot, value: Value) -> camlink_core::Result<()> {
        self.inner.publish(code, slot, value).await
    }

    async fn append(
        &self,
        code: &SessionCode,
        log: CandidateLog,
        value: Value,
    ) -> camlink_core::Result<String> {
        self.inner.append(code, log, value).await
    }

    async fn subscribe_slot(
        &self,
        code: &SessionCode,
        slot: Slot,
    ) -> camlink_core::Result<Subscription<Value>> {
        self.inner.subscribe_slot(code, slot).await
    }

    async fn subscribe_appends(
        &self,
        code: &SessionCode,
        log: CandidateLog,
    ) -> camlink_core::Result<Subscription<LogEntry>> {
        self.inner.subscribe_appends(code, log).await
    }

    async fn remove_namespace(&self, code: &SessionCode) -> camlink_core::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.remove_namespace(code).await
    }
}

#[tokio::test]
async fn test_restart_while_fatal_teardown_in_progress() {
    init_logging();

    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(SlowRemoveStore {
        inner: Arc::clone(&memory),
        delay: Duration::from_millis(200),
    });
    let code = code("482-913");

    let mut camera = TestPeer::with_store(
        store as Arc<dyn RendezvousStore>,
        ScriptedMediaEngine::new("camera").rejecting_descriptions(),
        quiet_config(),
    );
    camera.start_offerer(&code).await.unwrap();

    memory
        .publish(
            &code,
            Slot::Answer,
            encode_description(&SessionDescription::answer("v=0")).unwrap(),
        )
        .await
        .unwrap();

    let closed = camera
        .next_event(|e| {
            matches!(
                e,
                SessionEvent::StateChanged {
                    to: SignalingState::Closed,
                    ..
                }
            )
        })
        .await;
    assert!(closed.is_some());
    // Removal is still sleeping
    assert!(memory.contains_namespace(&code));

    camera.replace_media(ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();
    assert_eq!(camera.session.state(), SignalingState::PeerDescriptionPending);
    assert!(memory.contains_namespace(&code));

    camera.session.hangup().await;
    assert!(!memory.contains_namespace(&code));
}

// ============================================================================
// Reservation
// ============================================================================

#[tokio::test]
async fn test_concurrent_reservation_one_winner() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("111-111");

    let mut first = TestPeer::new(&store, ScriptedMediaEngine::new("camera-a"));
    let mut second = TestPeer::new(&store, ScriptedMediaEngine::new("camera-b"));

    let (a, b) = tokio::join!(first.start_offerer(&code), second.start_offerer(&code));

    let results = [a, b];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let conflict = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(conflict, Error::CodeConflict(_)));

    let (winner, loser) = if results[0].is_ok() {
        (&first, &second)
    } else {
        (&second, &first)
    };
    assert_eq!(winner.session.state(), SignalingState::PeerDescriptionPending);
    assert_eq!(loser.session.state(), SignalingState::Idle);
    assert!(loser.media.is_closed());
    assert!(loser.media.calls().created.is_empty());
}

#[tokio::test]
async fn test_conflict_then_fresh_code() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let taken = code("777-777");
    store.create_namespace(&taken).await.unwrap();

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    let err = camera.start_offerer(&taken).await.unwrap_err();
    assert!(matches!(err, Error::CodeConflict(_)));
    assert_eq!(camera.session.state(), SignalingState::Idle);
    // Reserved by someone else: left alone
    assert!(store.contains_namespace(&taken));

    camera.replace_media(ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code("777-778")).await.unwrap();
    assert_eq!(camera.session.state(), SignalingState::PeerDescriptionPending);
}

#[tokio::test]
async fn test_store_unavailable_on_start() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    store.set_available(false);

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    let err = camera.start_offerer(&code("808-808")).await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(camera.session.state(), SignalingState::Idle);

    let mut viewer = TestPeer::new(&store, ScriptedMediaEngine::new("viewer"));
    let err = viewer.start_answerer(&code("808-808")).await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
    assert!(viewer.session.state().can_start());
}

// ============================================================================
// Restart and waiting
// ============================================================================

#[tokio::test]
async fn test_restart_after_hangup() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("246-246");

    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();

    let err = camera.start_offerer(&code).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    camera.session.hangup().await;
    camera.replace_media(ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code).await.unwrap();
    assert_eq!(camera.session.state(), SignalingState::PeerDescriptionPending);

    let snapshot = camera.session.snapshot().unwrap();
    assert!(!snapshot.peer_description_applied);
    assert!(snapshot.owns_namespace);
}

#[tokio::test]
async fn test_reused_media_engine_rejected() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let mut camera = TestPeer::new(&store, ScriptedMediaEngine::new("camera"));
    camera.start_offerer(&code("369-369")).await.unwrap();
    camera.session.hangup().await;

    // Events of the first engine were already taken
    let err = camera.start_offerer(&code("369-370")).await.unwrap_err();
    assert!(matches!(err, Error::MediaError(_)));
}

#[tokio::test]
async fn test_waits_indefinitely_without_offer() {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    let code = code("000-000");

    let mut viewer = TestPeer::new(&store, ScriptedMediaEngine::new("viewer"));
    viewer.start_answerer(&code).await.unwrap();

    for _ in 0..5 {
        settle().await;
    }

    assert_eq!(viewer.session.state(), SignalingState::Initializing);
    assert_eq!(store.active_watchers(&code), 2);
    let events = viewer.drain_events();
    assert!(events
        .iter()
        .all(|e| matches!(e, SessionEvent::StateChanged { .. } | SessionEvent::WaitingForOffer)));

    viewer.session.hangup().await;
    assert_eq!(store.active_watchers(&code), 0);
    assert!(!store.contains_namespace(&code));
}
