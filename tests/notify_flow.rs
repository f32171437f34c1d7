// tests/notify_flow.rs
// Commit-to-notification pipeline over the assembled AppState: a committed
// revision reaches every open connection of the owning user and nobody
// else, as a payload-free frame.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use repairsync::consolidate::InMemoryPointerStore;
use repairsync::notify::ws::StaticTokenAuthenticator;
use repairsync::notify::WsServerFrame;
use repairsync::session::InMemorySessionOwners;
use repairsync::state::{create_app_state, spawn_commit_forwarder, AppState};
use repairsync::storage::{InMemoryObjectStore, ObjectStore};

fn build_state() -> (Arc<AppState>, Arc<InMemorySessionOwners>) {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::default());
    let owners = Arc::new(InMemorySessionOwners::new());
    let state = Arc::new(create_app_state(
        store,
        Arc::new(InMemoryPointerStore::new()),
        owners.clone(),
        Arc::new(StaticTokenAuthenticator::new("test-token")),
    ));
    (state, owners)
}

async fn expect_session_updated(
    handle: &mut repairsync::notify::ConnectionHandle,
) -> (i64, u64) {
    let frame = timeout(Duration::from_secs(2), handle.next_event())
        .await
        .expect("timed out waiting for notification")
        .expect("connection closed unexpectedly");
    match frame {
        WsServerFrame::SessionUpdated {
            session_id,
            revision,
            ..
        } => (session_id, revision),
        other => panic!("expected session_updated, got {other:?}"),
    }
}

#[tokio::test]
async fn committed_revision_reaches_all_of_the_owners_tabs() {
    let (state, owners) = build_state();
    owners.assign(501, 7).await;
    let _forwarder = spawn_commit_forwarder(state.clone());

    let mut tab_a = state.bus.subscribe(7).await;
    let mut tab_b = state.bus.subscribe(7).await;

    state
        .consolidator
        .record_phase(501, "Started", json!({"deviceType": "Laptop"}))
        .await
        .unwrap();

    for tab in [&mut tab_a, &mut tab_b] {
        let (session_id, revision) = expect_session_updated(tab).await;
        assert_eq!(session_id, 501);
        assert_eq!(revision, 1);
    }
}

#[tokio::test]
async fn other_users_never_see_the_event() {
    let (state, owners) = build_state();
    owners.assign(501, 7).await;
    let _forwarder = spawn_commit_forwarder(state.clone());

    let mut owner_tab = state.bus.subscribe(7).await;
    let mut stranger_tab = state.bus.subscribe(8).await;

    state
        .consolidator
        .record_phase(501, "Diagnosed", json!({"cause": "battery"}))
        .await
        .unwrap();

    expect_session_updated(&mut owner_tab).await;
    assert!(stranger_tab.try_next_event().is_none());
}

#[tokio::test]
async fn every_commit_produces_its_own_signal() {
    let (state, owners) = build_state();
    owners.assign(501, 7).await;
    let _forwarder = spawn_commit_forwarder(state.clone());

    let mut tab = state.bus.subscribe(7).await;

    state
        .consolidator
        .record_phase(501, "Started", json!({"deviceType": "Laptop"}))
        .await
        .unwrap();
    state
        .consolidator
        .record_phase(501, "Diagnosed", json!({"cause": "battery"}))
        .await
        .unwrap();

    let (_, first) = expect_session_updated(&mut tab).await;
    let (_, second) = expect_session_updated(&mut tab).await;
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    // Frames carry no payload; the client re-fetches.
    let record = state.consolidator.get_consolidated(501).await.unwrap();
    assert_eq!(record.revision, 2);
}

#[tokio::test]
async fn unowned_sessions_are_skipped_not_broadcast() {
    let (state, _owners) = build_state();
    let _forwarder = spawn_commit_forwarder(state.clone());

    let mut tab = state.bus.subscribe(7).await;

    // No owner registered for this session.
    state
        .consolidator
        .record_phase(999, "Started", json!({}))
        .await
        .unwrap();

    // Give the forwarder a beat; nothing should arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tab.try_next_event().is_none());
}
