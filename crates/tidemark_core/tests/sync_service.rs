mod common;

use common::{board_patch, note_patch, GatedRemote, Harness, START_MS, USER};
use serde_json::json;
use std::sync::Arc;
use tidemark_core::model::record::new_record_id;
use tidemark_core::{
    EngineConfig, Note, RecordStatus, SyncEngine, SyncRecord, SyncService, TaskBoard,
};

fn start<R: SyncRecord>(harness: &Harness) -> SyncService<R> {
    SyncService::start(Arc::new(harness.engine::<R>())).unwrap()
}

fn other_device_note(title: &str) -> Note {
    Note {
        uuid: new_record_id(),
        title: title.to_string(),
        content: String::new(),
        preview_text: None,
        preview_image: None,
        ends_at: None,
        tags: Vec::new(),
        status: RecordStatus::Active,
        created_at: START_MS,
        updated_at: Some(START_MS),
    }
}

#[test]
fn service_save_returns_before_push_and_push_follows() {
    let harness = Harness::online();
    let service = start::<TaskBoard>(&harness);

    let board = service.save(None, board_patch("Home", &["todo", "done"])).unwrap();
    assert_eq!(service.engine().get(board.uuid), Some(board.clone()));

    assert!(service.flush());
    assert_eq!(service.engine().pending_len(), 0);
    assert_eq!(
        harness.remote_field::<TaskBoard>(board.uuid, "name"),
        json!("Home")
    );
}

#[test]
fn reconnect_triggers_one_reconciliation() {
    let harness = Harness::offline();
    let service = start::<Note>(&harness);
    let note = service.save(None, note_patch("offline", "")).unwrap();
    assert!(service.flush());
    assert_eq!(service.engine().pending_len(), 1);
    assert_eq!(harness.remote.query_count(), 0);

    harness.clock.advance(5_000);
    harness.connectivity.set_connected(true);
    assert!(service.flush());

    assert_eq!(harness.remote.query_count(), 1);
    assert_eq!(service.engine().pending_len(), 0);
    assert_eq!(harness.remote_field::<Note>(note.uuid, "title"), json!("offline"));
    assert_eq!(service.engine().last_sync_at(), START_MS + 5_000);
}

#[test]
fn going_offline_does_not_trigger_reconciliation() {
    let harness = Harness::online();
    let service = start::<Note>(&harness);

    harness.connectivity.set_connected(false);
    assert!(service.flush());

    assert_eq!(harness.remote.query_count(), 0);
}

#[test]
fn remote_notifications_are_throttled_by_last_sync_time() {
    let harness = Harness::online();
    let service = start::<Note>(&harness);

    harness.put_remote(&other_device_note("first"), USER);
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 1);
    assert_eq!(service.engine().collection().len(), 1);

    harness.clock.advance(999);
    harness.put_remote(&other_device_note("too soon"), USER);
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 1);

    harness.clock.advance(2);
    harness.put_remote(&other_device_note("after window"), USER);
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 2);
    assert_eq!(service.engine().collection().len(), 3);
}

#[test]
fn overlapping_requests_collapse_into_one_run() {
    let harness = Harness::online();
    let (gated, gate) = GatedRemote::new(harness.remote.clone());
    let engine = SyncEngine::<Note>::new(
        harness.collection(),
        harness.env_with_remote(Arc::new(gated)),
        EngineConfig::default(),
    );
    let service = SyncService::start(Arc::new(engine)).unwrap();

    assert!(service.request_reconcile());
    gate.entered.recv().unwrap();
    assert!(!service.request_reconcile());
    harness.connectivity.set_connected(false);
    harness.connectivity.set_connected(true);
    assert!(!service.request_reconcile());

    gate.release.send(()).unwrap();
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 1);

    assert!(service.request_reconcile());
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 2);
}

#[test]
fn own_writes_during_reconciliation_do_not_cause_another_run() {
    let harness = Harness::offline();
    let service = start::<Note>(&harness);
    for title in ["a", "b", "c"] {
        service.save(None, note_patch(title, "")).unwrap();
    }
    assert!(service.flush());

    harness.clock.advance(10_000);
    harness.connectivity.set_connected(true);
    assert!(service.flush());

    assert_eq!(harness.remote.write_count(), 3);
    assert_eq!(harness.remote.query_count(), 1);
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 1);
}

#[test]
fn one_subscription_per_user_and_none_when_signed_out() {
    let harness = Harness::online();
    let service = start::<Note>(&harness);
    assert_eq!(harness.remote.listener_count_for(Note::COLLECTION, USER), 1);

    assert!(!service.refresh_user().unwrap());
    assert_eq!(harness.remote.listener_count(), 1);

    harness.auth.sign_in("user-2");
    assert!(service.refresh_user().unwrap());
    assert_eq!(harness.remote.listener_count_for(Note::COLLECTION, USER), 0);
    assert_eq!(harness.remote.listener_count_for(Note::COLLECTION, "user-2"), 1);
    assert_eq!(harness.remote.listener_count(), 1);

    harness.auth.sign_out();
    assert!(service.refresh_user().unwrap());
    assert_eq!(harness.remote.listener_count(), 0);
}

#[test]
fn notifications_follow_the_current_user() {
    let harness = Harness::online();
    let service = start::<Note>(&harness);
    harness.auth.sign_in("user-2");
    service.refresh_user().unwrap();

    harness.put_remote(&other_device_note("for old user"), USER);
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 0);

    harness.put_remote(&other_device_note("for new user"), "user-2");
    assert!(service.flush());
    assert_eq!(harness.remote.query_count(), 1);
    assert_eq!(service.engine().collection().len(), 1);
}

#[test]
fn dropping_the_service_releases_every_listener() {
    let harness = Harness::online();
    let service = start::<Note>(&harness);
    assert_eq!(harness.remote.listener_count(), 1);
    assert_eq!(harness.connectivity.listener_count(), 1);

    drop(service);

    assert_eq!(harness.remote.listener_count(), 0);
    assert_eq!(harness.connectivity.listener_count(), 0);
}

#[test]
fn queued_pushes_finish_before_shutdown() {
    let harness = Harness::online();
    let service = start::<Note>(&harness);
    let note = service.save(None, note_patch("last words", "")).unwrap();
    let engine = Arc::clone(service.engine());

    drop(service);

    assert_eq!(engine.pending_len(), 0);
    assert_eq!(harness.remote_field::<Note>(note.uuid, "title"), json!("last words"));
}
