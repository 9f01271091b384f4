mod common;

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use bookingsync::{
    booking::BookingDetails,
    bus::{BusMessage, MessageKind},
    entity::{EntityData, EntityPatch, EventPatch},
    op::SyncOpKind,
    remote::{Method, RemoteError},
    sync::Engine,
    types::{now_ms, Collection, EntityId, RemoteId},
};

use common::{engine, event, user};

fn capture(engine: &Engine, kind: MessageKind) -> Arc<Mutex<Vec<BusMessage>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = engine.bus().subscribe(kind, move |m| sink.lock().expect("lock").push(m.clone()));
    seen
}

fn server_event(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name, "status": "published", "max_participants": 10 })
}

fn name_of(engine: &Engine, id: &EntityId) -> Option<String> {
    engine
        .get_by_id(Collection::Events, id)
        .expect("get")
        .and_then(|e| e.as_event().map(|d| d.name.clone()))
}

/// Sends every due item and answers each with `respond`, until nothing is left to send.
fn pump(engine: &mut Engine, mut respond: impl FnMut(Method, &str, Option<&Value>) -> Result<Value, RemoteError>) {
    loop {
        let batch = engine.next_dispatches(u64::MAX, None);
        if batch.is_empty() {
            return;
        }
        for d in batch {
            let result = respond(d.request.method, &d.request.path, d.request.body.as_ref());
            engine.on_sync_result(d.item_id, d.collection, result);
        }
    }
}

#[test]
fn confirmed_insert_records_remote_id() {
    let mut engine = engine();
    let completed = capture(&engine, MessageKind::SyncComplete);
    let local = engine
        .create(EntityData::Event(event("Sailing", Some(8))))
        .expect("create");

    let batch = engine.next_dispatches(now_ms(), None);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].request.method, Method::Post);
    assert_eq!(batch[0].request.path, "/events");

    let body = batch[0].request.body.clone().expect("body");
    let mut echoed = body.clone();
    echoed["id"] = json!(42);
    assert!(engine.on_sync_result(batch[0].item_id, Collection::Events, Ok(echoed)));

    let stored = engine
        .get_by_id(Collection::Events, &local.id())
        .expect("get")
        .expect("stored");
    assert_eq!(stored.key.remote, Some(RemoteId::new("42")));
    assert_eq!(stored.key.local, local.key.local);
    assert_eq!(
        engine
            .get_by_id(Collection::Events, &EntityId::remote("42"))
            .expect("get")
            .map(|e| e.key.local),
        Some(local.key.local)
    );
    assert_eq!(engine.pending_count(), 0);

    engine.bus().flush();
    assert_eq!(completed.lock().expect("lock").len(), 1);
}

#[test]
fn failures_back_off_and_notify_once() {
    let mut engine = engine();
    let failed = capture(&engine, MessageKind::SyncFailed);
    engine
        .create(EntityData::User(user("Alice")))
        .expect("create");

    for attempt in 1..=7u32 {
        let now = now_ms();
        let batch = engine.next_dispatches(u64::MAX, None);
        assert_eq!(batch.len(), 1, "attempt {attempt}");
        assert!(!engine.on_sync_result(
            batch[0].item_id,
            Collection::Users,
            Err(RemoteError::Unavailable("down".to_string())),
        ));

        let item = engine.queue().iter().next().expect("item kept");
        assert_eq!(item.retry_count, attempt);
        assert!(item.next_attempt_ms > now);
        assert!(engine.next_dispatches(now, None).is_empty(), "backoff holds the item");
    }

    engine.bus().flush();
    let failed = failed.lock().expect("lock");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["retry_count"], json!(5));
    assert_eq!(engine.pending_count(), 1);
}

#[test]
fn dependent_insert_waits_for_referenced_record() {
    let mut engine = engine();
    let ev = engine
        .create(EntityData::Event(event("Hike", Some(4))))
        .expect("event")
        .id();
    let alice = engine.create(EntityData::User(user("Alice"))).expect("user").id();

    // Confirm the user only; the event stays unconfirmed.
    let batch = engine.next_dispatches(u64::MAX, None);
    let user_item = batch
        .iter()
        .find(|d| d.collection == Collection::Users)
        .expect("user dispatched");
    engine.on_sync_result(user_item.item_id, Collection::Users, Ok(json!({ "id": "u-1" })));
    let event_item = batch
        .iter()
        .find(|d| d.collection == Collection::Events)
        .expect("event dispatched");

    engine
        .book_event(&ev, &alice, BookingDetails::default())
        .expect("book");
    let next = engine.next_dispatches(u64::MAX, None);
    assert!(next.iter().all(|d| d.collection != Collection::Bookings), "booking blocked");

    engine.on_sync_result(event_item.item_id, Collection::Events, Ok(json!({ "id": "e-1" })));

    let mut sent_booking = None;
    pump(&mut engine, |method, path, body| {
        if method == Method::Post && path == "/bookings" {
            sent_booking = body.cloned();
            return Ok(json!({ "id": "b-1" }));
        }
        Ok(json!({}))
    });

    let sent = sent_booking.expect("booking sent");
    assert_eq!(sent["event_id"], json!("e-1"));
    assert_eq!(sent["user_id"], json!("u-1"));
    assert_eq!(engine.pending_count(), 0);

    let booking = engine
        .get_by_id(Collection::Bookings, &EntityId::remote("b-1"))
        .expect("get")
        .expect("booking");
    assert_eq!(
        booking.as_booking().map(|b| b.event_id.clone()),
        Some(EntityId::remote("e-1"))
    );
}

#[test]
fn update_before_confirmation_is_sent_to_remote_path() {
    let mut engine = engine();
    let ev = engine
        .create(EntityData::Event(event("Museum", None)))
        .expect("event")
        .id();
    engine
        .update(
            &ev,
            EntityPatch::Event(EventPatch {
                location: Some("Old town".to_string()),
                ..EventPatch::default()
            }),
        )
        .expect("update");

    let mut seen = Vec::new();
    pump(&mut engine, |method, path, body| {
        seen.push((method, path.to_string(), body.cloned()));
        match method {
            Method::Post => Ok(json!({ "id": "e-9" })),
            _ => Ok(json!({})),
        }
    });

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, Method::Post);
    assert_eq!(seen[1].0, Method::Put);
    assert_eq!(seen[1].1, "/events/e-9");
    assert_eq!(seen[1].2, Some(json!({ "location": "Old town" })));
}

#[test]
fn deleting_unsynced_record_sends_nothing() {
    let mut engine = engine();
    let ev = engine
        .create(EntityData::Event(event("Scrapped", None)))
        .expect("event")
        .id();
    engine
        .update(
            &ev,
            EntityPatch::Event(EventPatch {
                category: Some("misc".to_string()),
                ..EventPatch::default()
            }),
        )
        .expect("update");
    assert_eq!(engine.pending_count(), 2);

    assert!(engine.delete(Collection::Events, &ev).expect("delete"));
    assert_eq!(engine.pending_count(), 0);
    assert!(engine.next_dispatches(u64::MAX, None).is_empty());
}

#[test]
fn deleting_synced_record_sends_delete() {
    let mut engine = engine();
    let ev = engine
        .create(EntityData::Event(event("Done", None)))
        .expect("event")
        .id();
    pump(&mut engine, |_, _, _| Ok(json!({ "id": "e-5" })));

    assert!(engine.delete(Collection::Events, &ev).expect("delete"));
    let mut sent = Vec::new();
    pump(&mut engine, |method, path, _| {
        sent.push((method, path.to_string()));
        Ok(Value::Null)
    });
    assert_eq!(sent, vec![(Method::Delete, "/events/e-5".to_string())]);
    assert_eq!(engine.pending_count(), 0);
}

#[test]
fn offline_engine_dispatches_nothing_and_announces_state() {
    let mut engine = engine();
    let online = capture(&engine, MessageKind::NetworkOnline);
    let offline = capture(&engine, MessageKind::NetworkOffline);

    assert!(engine.set_online(false));
    assert!(!engine.set_online(false));
    engine
        .create(EntityData::User(user("Offline")))
        .expect("create");
    assert!(engine.next_dispatches(u64::MAX, None).is_empty());

    assert!(engine.set_online(true));
    assert_eq!(engine.next_dispatches(now_ms(), None).len(), 1);

    engine.bus().flush();
    assert_eq!(offline.lock().expect("lock").len(), 1);
    assert_eq!(online.lock().expect("lock").len(), 1);
}

#[test]
fn discard_pending_drops_queued_items() {
    let mut engine = engine();
    let alice = engine.create(EntityData::User(user("Alice"))).expect("user").id();
    assert_eq!(engine.discard_pending(Collection::Users, &alice).expect("discard"), 1);
    assert_eq!(engine.pending_count(), 0);
    assert!(engine.get_by_id(Collection::Users, &alice).expect("get").is_some());
}

#[test]
fn refresh_inserts_updates_and_removes_clean_records() {
    let mut engine = engine();
    let report = engine
        .merge_remote(
            Collection::Events,
            vec![server_event("a", "Alpha"), server_event("b", "Beta"), json!({ "name": "no id" })],
            now_ms(),
        )
        .expect("merge");
    assert!(report.remote_available);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(engine.pending_count(), 0);

    let report = engine
        .merge_remote(Collection::Events, vec![server_event("a", "Alpha v2")], now_ms())
        .expect("merge");
    assert_eq!(report.updated, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(name_of(&engine, &EntityId::remote("a")).as_deref(), Some("Alpha v2"));
    assert!(engine
        .get_by_id(Collection::Events, &EntityId::remote("b"))
        .expect("get")
        .is_none());
}

#[test]
fn refresh_keeps_pending_local_edits_and_deletions() {
    let mut engine = engine();
    engine
        .merge_remote(
            Collection::Events,
            vec![server_event("a", "Alpha"), server_event("b", "Beta")],
            now_ms(),
        )
        .expect("merge");

    engine
        .update(
            &EntityId::remote("a"),
            EntityPatch::Event(EventPatch {
                name: Some("Alpha (local)".to_string()),
                ..EventPatch::default()
            }),
        )
        .expect("update");
    assert!(engine
        .delete(Collection::Events, &EntityId::remote("b"))
        .expect("delete"));

    let report = engine
        .merge_remote(
            Collection::Events,
            vec![server_event("a", "Alpha (server)"), server_event("b", "Beta")],
            now_ms(),
        )
        .expect("merge");

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].remote, RemoteId::new("a"));
    assert_eq!(report.skipped, 1);
    assert_eq!(name_of(&engine, &EntityId::remote("a")).as_deref(), Some("Alpha (local)"));
    assert!(engine
        .get_by_id(Collection::Events, &EntityId::remote("b"))
        .expect("get")
        .is_none());
}

#[test]
fn stale_fetch_does_not_remove_newer_records() {
    let mut engine = engine();
    engine
        .merge_remote(Collection::Events, vec![server_event("a", "Alpha")], now_ms())
        .expect("merge");

    let report = engine
        .merge_remote(Collection::Events, Vec::new(), 0)
        .expect("merge");
    assert_eq!(report.removed, 0);
    assert!(engine
        .get_by_id(Collection::Events, &EntityId::remote("a"))
        .expect("get")
        .is_some());
}

#[test]
fn failed_refresh_leaves_local_data() {
    let mut engine = engine();
    let failed = capture(&engine, MessageKind::SyncFailed);
    engine
        .create(EntityData::Event(event("Local only", None)))
        .expect("create");

    let report = engine.refresh_failed(Collection::Events, &RemoteError::Timeout(500));
    assert!(!report.remote_available);
    assert_eq!(
        engine.get_all(Collection::Events, |_| true).expect("all").len(),
        1
    );
    engine.bus().flush();
    assert_eq!(failed.lock().expect("lock").len(), 1);
}

#[test]
fn store_events_carry_collection_and_id() {
    let mut engine = engine();
    let inserts = capture(&engine, MessageKind::DbInsert);
    let ev = engine
        .create(EntityData::Event(event("Payload", None)))
        .expect("create");

    engine.bus().flush();
    let inserts = inserts.lock().expect("lock");
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].payload["collection"], json!("events"));
    assert_eq!(inserts[0].payload["id"], json!(ev.key.local.0));
    assert_eq!(engine.queue().iter().next().map(|i| i.kind()), Some(SyncOpKind::Insert));
}

#[test]
fn server_ids_are_scoped_by_collection() {
    let mut engine = engine();
    engine
        .merge_remote(
            Collection::Users,
            vec![json!({ "id": 1, "display_name": "Ann" })],
            now_ms(),
        )
        .expect("users");
    engine
        .merge_remote(
            Collection::Events,
            vec![json!({ "id": 1, "name": "Gala", "status": "published" })],
            now_ms(),
        )
        .expect("events");
    engine
        .merge_remote(
            Collection::Bookings,
            vec![json!({ "id": 1, "event_id": 1, "user_id": 1 })],
            now_ms(),
        )
        .expect("bookings");

    let one = EntityId::remote("1");
    let ann = engine
        .get_by_id(Collection::Users, &one)
        .expect("get")
        .expect("user");
    let gala = engine
        .get_by_id(Collection::Events, &one)
        .expect("get")
        .expect("event");
    assert_ne!(ann.key.local, gala.key.local);
    assert_eq!(ann.as_user().map(|u| u.display_name.as_str()), Some("Ann"));
    assert_eq!(name_of(&engine, &one).as_deref(), Some("Gala"));

    let booking = engine
        .get_by_id(Collection::Bookings, &one)
        .expect("get")
        .expect("booking");
    let data = booking.as_booking().expect("booking data");
    assert_eq!(data.event_id, one);
    assert_eq!(data.user_id, one);

    assert!(engine.delete(Collection::Users, &one).expect("delete user"));
    let report = engine
        .merge_remote(
            Collection::Events,
            vec![json!({ "id": 1, "name": "Gala v2", "status": "published" })],
            now_ms(),
        )
        .expect("events again");
    assert_eq!(report.skipped, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(name_of(&engine, &one).as_deref(), Some("Gala v2"));
}

#[test]
fn refresh_during_pending_creation_does_not_duplicate() {
    let mut engine = engine();
    let local = engine
        .create(EntityData::Event(event("Sailing", Some(8))))
        .expect("create");
    let batch = engine.next_dispatches(now_ms(), None);
    assert_eq!(batch.len(), 1);

    let report = engine
        .merge_remote(Collection::Events, vec![server_event("srv-1", "Sailing")], now_ms())
        .expect("merge");
    assert_eq!(report.inserted, 0);
    assert_eq!(report.skipped, 1);

    let mut echoed = batch[0].request.body.clone().expect("body");
    echoed["id"] = json!("srv-1");
    assert!(engine.on_sync_result(batch[0].item_id, Collection::Events, Ok(echoed)));

    let events = engine.get_all(Collection::Events, |_| true).expect("all");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].key.local, local.key.local);
    assert_eq!(events[0].key.remote, Some(RemoteId::new("srv-1")));

    engine
        .merge_remote(Collection::Events, vec![server_event("srv-1", "Sailing")], now_ms())
        .expect("merge again");
    assert_eq!(engine.get_all(Collection::Events, |_| true).expect("all").len(), 1);
}

#[test]
fn confirmation_replaces_copy_fetched_after_lost_response() {
    let mut engine = engine();
    let deletes = capture(&engine, MessageKind::DbDelete);
    let local = engine
        .create(EntityData::Event(event("Sailing", Some(8))))
        .expect("create");

    // The server stored the record but the response never arrived.
    let batch = engine.next_dispatches(now_ms(), None);
    engine.on_sync_result(
        batch[0].item_id,
        Collection::Events,
        Err(RemoteError::Timeout(500)),
    );
    let report = engine
        .merge_remote(Collection::Events, vec![server_event("srv-1", "Sailing")], now_ms())
        .expect("merge");
    assert_eq!(report.inserted, 1);

    pump(&mut engine, |_, _, _| Ok(json!({ "id": "srv-1" })));

    let events = engine.get_all(Collection::Events, |_| true).expect("all");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].key.local, local.key.local);
    let by_remote = engine
        .get_by_id(Collection::Events, &EntityId::remote("srv-1"))
        .expect("get")
        .expect("event");
    assert_eq!(by_remote.key.local, local.key.local);

    engine.bus().flush();
    assert_eq!(deletes.lock().expect("lock").len(), 1);
}

#[test]
fn confirmed_delete_stops_shadowing_later_fetches() {
    let mut engine = engine();
    engine
        .merge_remote(Collection::Events, vec![server_event("a", "Alpha")], now_ms())
        .expect("merge");
    assert!(engine
        .delete(Collection::Events, &EntityId::remote("a"))
        .expect("delete"));
    pump(&mut engine, |_, _, _| Ok(Value::Null));
    assert_eq!(engine.pending_count(), 0);

    // A fetch that began before the delete was confirmed may still list it.
    let report = engine
        .merge_remote(Collection::Events, vec![server_event("a", "Alpha")], 0)
        .expect("stale merge");
    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 0);

    // A later fetch is the server's word: the record exists again.
    let report = engine
        .merge_remote(Collection::Events, vec![server_event("a", "Alpha again")], now_ms() + 1)
        .expect("fresh merge");
    assert_eq!(report.inserted, 1);
    assert_eq!(name_of(&engine, &EntityId::remote("a")).as_deref(), Some("Alpha again"));
}
