//! Room scenarios driven through the coordinator with in-memory stores.
//!
//! Timing-sensitive cases run on a paused tokio clock so debounce windows
//! elapse deterministically.

use canvas_sync::protocol::{JoinRoom, LockRequest, ObjectRef, SendMessage};
use canvas_sync::storage::{DurableStore, EphemeralStore, MemoryDatabase, MemoryKv};
use canvas_sync::{ClientEvent, Coordinator, ObjectData, ServerEvent, Session, SyncConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

type Inbox = mpsc::Receiver<Arc<ServerEvent>>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Harness {
    coordinator: Coordinator,
    db: Arc<MemoryDatabase>,
    kv: Arc<MemoryKv>,
}

impl Harness {
    fn new() -> Self {
        let db = Arc::new(MemoryDatabase::new());
        let kv = Arc::new(MemoryKv::new());
        let coordinator = Coordinator::new(SyncConfig::for_testing(), db.clone(), kv.clone());
        Self { coordinator, db, kv }
    }

    async fn join(&self, room: &str, name: &str) -> (Session, Inbox) {
        let (mut session, mut inbox) = self.coordinator.connect().unwrap();
        self.coordinator
            .handle(
                &mut session,
                ClientEvent::JoinRoom(JoinRoom { room_id: room.into(), display_name: name.into() }),
            )
            .await;
        assert!(matches!(next(&mut inbox), ServerEvent::InitialState { .. }));
        (session, inbox)
    }

    async fn send(&self, session: &mut Session, event: ClientEvent) {
        self.coordinator.handle(session, event).await;
    }
}

fn next(inbox: &mut Inbox) -> ServerEvent {
    match inbox.try_recv() {
        Ok(event) => (*event).clone(),
        Err(e) => panic!("expected an event, got {e:?}"),
    }
}

fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = inbox.try_recv() {
        events.push((*event).clone());
    }
    events
}

fn create(id: &str, payload: Value) -> ClientEvent {
    ClientEvent::CreateObject(ObjectData::new(id, "rect", payload))
}

fn update(id: &str, payload: Value) -> ClientEvent {
    ClientEvent::UpdateObject(ObjectData::new(id, "rect", payload))
}

fn lock(id: &str, name: &str) -> ClientEvent {
    ClientEvent::LockObject(LockRequest { id: id.into(), display_name: name.into() })
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_created_object() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    h.send(&mut alice, create("o1", json!({"x": 0, "y": 0}))).await;

    let (mut bob, mut rx_b) = h.coordinator.connect().unwrap();
    h.send(
        &mut bob,
        ClientEvent::JoinRoom(JoinRoom { room_id: "r1".into(), display_name: "Bob".into() }),
    )
    .await;

    match next(&mut rx_b) {
        ServerEvent::InitialState { room, objects } => {
            assert_eq!(room.id, "r1");
            assert_eq!(room.name, "Room r1");
            assert_eq!(objects.len(), 1);
            assert_eq!(objects[0].id, "o1");
            assert_eq!(objects[0].data, json!({"x": 0, "y": 0}));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_join_notifies_others_not_self() {
    let h = Harness::new();
    let (_alice, mut rx_a) = h.join("r1", "Alice").await;
    let (_bob, mut rx_b) = h.join("r1", "Bob").await;

    assert_eq!(next(&mut rx_a), ServerEvent::UserJoined { display_name: "Bob".into() });
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    let (_carol, mut rx_c) = h.join("r2", "Carol").await;

    h.send(&mut alice, create("o1", json!({}))).await;
    assert!(drain(&mut rx_c).is_empty());
}

#[tokio::test]
async fn test_create_is_not_echoed_to_sender() {
    let h = Harness::new();
    let (mut alice, mut rx_a) = h.join("r1", "Alice").await;
    let (_bob, mut rx_b) = h.join("r1", "Bob").await;
    drain(&mut rx_a);

    h.send(&mut alice, create("o1", json!({"x": 1}))).await;
    assert_eq!(
        next(&mut rx_b),
        ServerEvent::ObjectCreated(ObjectData::new("o1", "rect", json!({"x": 1})))
    );
    assert!(drain(&mut rx_a).is_empty());
}

#[tokio::test]
async fn test_conflicting_lock_reports_holder() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    let (mut bob, mut rx_b) = h.join("r1", "Bob").await;
    h.send(&mut alice, create("o1", json!({}))).await;
    h.send(&mut alice, lock("o1", "Alice")).await;
    assert_eq!(
        drain(&mut rx_b).last(),
        Some(&ServerEvent::ObjectLocked { id: "o1".into(), display_name: "Alice".into() })
    );

    h.send(&mut bob, lock("o1", "Bob")).await;
    match next(&mut rx_b) {
        ServerEvent::Error { kind, holder, .. } => {
            assert_eq!(kind, "lock-conflict");
            assert_eq!(holder.as_deref(), Some("Alice"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.coordinator.locks().holder("o1").await.unwrap().as_deref(), Some("Alice"));
}

#[tokio::test]
async fn test_locked_object_rejects_other_editors() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    let (mut bob, mut rx_b) = h.join("r1", "Bob").await;
    h.send(&mut alice, create("o1", json!({"x": 1}))).await;
    h.send(&mut alice, lock("o1", "Alice")).await;
    drain(&mut rx_b);

    h.send(&mut bob, update("o1", json!({"x": 99}))).await;
    h.send(&mut bob, ClientEvent::DeleteObject(ObjectRef { id: "o1".into() })).await;
    let errors = drain(&mut rx_b);
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| matches!(e, ServerEvent::Error { kind, .. } if kind == "lock-conflict")));

    let objects = h.coordinator.cache().get_objects("r1").await.unwrap();
    assert_eq!(objects[0].data, json!({"x": 1}));

    // the holder may still edit
    h.send(&mut alice, update("o1", json!({"x": 2}))).await;
    assert!(matches!(next(&mut rx_b), ServerEvent::ObjectUpdated(_)));
}

#[tokio::test]
async fn test_unlock_by_non_owner_rejected() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    let (mut bob, mut rx_b) = h.join("r1", "Bob").await;
    h.send(&mut alice, lock("o1", "Alice")).await;
    drain(&mut rx_b);

    h.send(
        &mut bob,
        ClientEvent::UnlockObject(LockRequest { id: "o1".into(), display_name: "Bob".into() }),
    )
    .await;
    assert!(matches!(next(&mut rx_b), ServerEvent::Error { .. }));
    assert_eq!(h.coordinator.locks().holder("o1").await.unwrap().as_deref(), Some("Alice"));

    h.send(
        &mut alice,
        ClientEvent::UnlockObject(LockRequest { id: "o1".into(), display_name: "Alice".into() }),
    )
    .await;
    assert_eq!(
        next(&mut rx_b),
        ServerEvent::ObjectUnlocked { id: "o1".into(), display_name: "Alice".into() }
    );
}

#[tokio::test(start_paused = true)]
async fn test_update_burst_commits_last_payload_once() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    h.send(&mut alice, create("o1", json!({"x": 0}))).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let baseline = h.db.stats().upserts;

    for x in 1..=3 {
        h.send(&mut alice, update("o1", json!({"x": x}))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.db.stats().upserts, baseline + 1);
    assert_eq!(h.db.object_count(), 1);
    let stored = h.db.get_object("o1").await.unwrap().unwrap();
    assert_eq!(stored.data, json!({"x": 3}));
    assert!(h.kv.get("object:o1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_disconnect_releases_locks_with_notifications() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    let (_bob, mut rx_b) = h.join("r1", "Bob").await;
    h.send(&mut alice, lock("o1", "Alice")).await;
    h.send(&mut alice, lock("o2", "Alice")).await;
    drain(&mut rx_b);

    h.coordinator.disconnect(alice).await;

    let events = drain(&mut rx_b);
    assert_eq!(events[0], ServerEvent::UserDisconnected { display_name: "Alice".into() });
    let mut unlocked: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ObjectUnlocked { id, display_name } if display_name == "Alice" => Some(id.clone()),
            _ => None,
        })
        .collect();
    unlocked.sort();
    assert_eq!(unlocked, vec!["o1", "o2"]);
    assert!(h.coordinator.locks().holder("o1").await.unwrap().is_none());
    assert!(h.coordinator.locks().holder("o2").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_last_leaver_flushes_staged_objects() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    h.send(&mut alice, create("o1", json!({"z": 1}))).await;
    h.send(&mut alice, create("o2", json!({"z": 2}))).await;
    assert_eq!(h.db.object_count(), 0);

    h.coordinator.disconnect(alice).await;

    assert_eq!(h.db.object_count(), 2);
    assert!(h.kv.scan_prefix("object:").await.unwrap().is_empty());
    assert_eq!(h.coordinator.rooms().room_count().await, 0);

    // the cleared debounce timers must not commit a second time
    let upserts = h.db.stats().upserts;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.db.stats().upserts, upserts);
}

#[tokio::test]
async fn test_delete_removes_everywhere_and_clears_lock() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    let (_bob, mut rx_b) = h.join("r1", "Bob").await;
    h.send(&mut alice, create("o1", json!({}))).await;
    h.coordinator.pipeline().flush_room("r1").await.unwrap();
    h.send(&mut alice, lock("o1", "Alice")).await;
    drain(&mut rx_b);

    h.send(&mut alice, ClientEvent::DeleteObject(ObjectRef { id: "o1".into() })).await;

    assert_eq!(next(&mut rx_b), ServerEvent::ObjectDeleted { id: "o1".into() });
    assert!(h.db.get_object("o1").await.unwrap().is_none());
    assert!(h.coordinator.cache().get_objects("r1").await.unwrap().is_empty());
    assert!(h.coordinator.locks().holder("o1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_delete_cancels_pending_write() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    h.send(&mut alice, create("o1", json!({}))).await;
    h.send(&mut alice, ClientEvent::DeleteObject(ObjectRef { id: "o1".into() })).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(h.db.get_object("o1").await.unwrap().is_none());
    assert!(h.kv.get("object:o1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_object_cannot_move_between_rooms() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    let (mut carol, mut rx_c) = h.join("r2", "Carol").await;
    h.send(&mut alice, create("o1", json!({}))).await;
    h.coordinator.pipeline().flush_room("r1").await.unwrap();

    h.send(&mut carol, update("o1", json!({"stolen": true}))).await;
    assert!(matches!(next(&mut rx_c), ServerEvent::Error { kind, .. } if kind == "validation"));
    assert_eq!(h.db.get_object("o1").await.unwrap().unwrap().room_id, "r1");
}

#[tokio::test]
async fn test_messages_are_appended_and_broadcast() {
    let h = Harness::new();
    let (mut alice, mut rx_a) = h.join("r1", "Alice").await;
    let (_bob, mut rx_b) = h.join("r1", "Bob").await;
    drain(&mut rx_a);

    h.send(
        &mut alice,
        ClientEvent::SendMessage(SendMessage { author: "Alice".into(), content: "hello".into() }),
    )
    .await;

    match next(&mut rx_b) {
        ServerEvent::NewMessage(message) => {
            assert_eq!(message.author, "Alice");
            assert_eq!(message.body, "hello");
            assert_eq!(message.room_id, "r1");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(drain(&mut rx_a).is_empty());
    let history = h.db.messages_in_room("r1").await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_missing_payload_rejected_without_side_effects() {
    let h = Harness::new();
    let (mut alice, mut rx_a) = h.join("r1", "Alice").await;
    let (_bob, mut rx_b) = h.join("r1", "Bob").await;
    drain(&mut rx_a);

    h.send(&mut alice, ClientEvent::CreateObject(ObjectData::new("o1", "rect", Value::Null))).await;
    assert!(matches!(next(&mut rx_a), ServerEvent::Error { kind, .. } if kind == "validation"));
    assert!(drain(&mut rx_b).is_empty());
    assert!(h.kv.get("object:o1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_every_room() {
    let h = Harness::new();
    let (mut alice, mut rx_a) = h.join("r1", "Alice").await;
    let (mut carol, _rx_c) = h.join("r2", "Carol").await;
    h.send(&mut alice, create("a", json!({}))).await;
    h.send(&mut carol, create("c", json!({}))).await;

    let report = h.coordinator.shutdown().await;

    assert!(report.is_clean());
    assert_eq!(h.db.object_count(), 2);
    assert!(h.kv.is_empty());
    assert!(drain(&mut rx_a)
        .iter()
        .any(|e| matches!(e, ServerEvent::ServerShutdown { .. })));

    h.send(&mut alice, create("late", json!({}))).await;
    assert!(matches!(next(&mut rx_a), ServerEvent::Error { kind, .. } if kind == "unavailable"));
}

#[tokio::test]
async fn test_stats_track_events_and_rejections() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    h.send(&mut alice, create("", json!({}))).await;

    let stats = h.coordinator.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_events, 2);
    assert_eq!(stats.rejected_events, 1);
    assert_eq!(stats.active_rooms, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unlock_notice_reaches_room_of_each_released_lock() {
    let h = Harness::new();
    let (mut alice_r1, _rx_a1) = h.join("r1", "Alice").await;
    let (mut alice_r2, _rx_a2) = h.join("r2", "Alice").await;
    h.send(&mut alice_r1, create("o1", json!({}))).await;
    h.send(&mut alice_r1, lock("o1", "Alice")).await;
    h.send(&mut alice_r2, create("o2", json!({}))).await;
    h.send(&mut alice_r2, lock("o2", "Alice")).await;
    let (_bob, mut rx_b) = h.join("r2", "Bob").await;

    h.coordinator.disconnect(alice_r1).await;

    let unlocked: Vec<String> = drain(&mut rx_b)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ObjectUnlocked { id, .. } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(unlocked, vec!["o2"]);
    assert!(h.coordinator.locks().holder("o2").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_write_refused_by_closed_pipeline_leaves_no_trace() {
    let h = Harness::new();
    let (mut alice, mut rx_a) = h.join("r1", "Alice").await;
    h.coordinator.pipeline().shutdown().await;

    h.send(&mut alice, create("o1", json!({"x": 1}))).await;
    assert!(matches!(next(&mut rx_a), ServerEvent::Error { kind, .. } if kind == "unavailable"));
    assert!(h.kv.get("object:o1").await.unwrap().is_none());
    assert!(h.coordinator.cache().get_objects("r1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_slow_commit_stays_deleted() {
    let h = Harness::new();
    let (mut alice, _rx_a) = h.join("r1", "Alice").await;
    h.db.set_upsert_delay(Duration::from_millis(500));
    h.send(&mut alice, create("o1", json!({"x": 1}))).await;
    // past the debounce window: the commit is in flight
    tokio::time::sleep(Duration::from_millis(150)).await;

    h.send(&mut alice, ClientEvent::DeleteObject(ObjectRef { id: "o1".into() })).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(h.db.get_object("o1").await.unwrap().is_none());
    assert!(h.kv.get("object:o1").await.unwrap().is_none());
    assert!(h.coordinator.cache().get_objects("r1").await.unwrap().is_empty());
}
