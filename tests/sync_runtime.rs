mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;

use bookingsync::{
    booking::BookingDetails,
    bus::MessageKind,
    entity::{EntityData, EntityPatch, UserPatch},
    remote::Method,
    sync::SyncConfig,
    types::{Collection, EntityId},
};

use common::{event, eventually, spawn, test_config, user, FakeServer};

#[tokio::test]
async fn local_write_returns_before_server_confirms() {
    let server = FakeServer::new();
    server.set_online(false);
    let handle = spawn(&server, test_config());

    let created = handle
        .create(EntityData::User(user("Alice")))
        .await
        .expect("create while server is down");
    assert!(created.key.remote.is_none());
    assert_eq!(handle.pending_count().await.expect("pending"), 1);

    server.set_online(true);
    let h = handle.clone();
    assert!(eventually(|| {
        let h = h.clone();
        async move { h.pending_count().await.expect("pending") == 0 }
    })
    .await);

    let stored = handle
        .get_by_id(Collection::Users, created.key.local)
        .await
        .expect("get")
        .expect("user");
    let remote = stored.key.remote.expect("remote id assigned");
    let on_server = server.record("users", remote.as_str()).expect("server copy");
    assert_eq!(on_server["display_name"], json!("Alice"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn reads_come_from_local_store_while_remote_fails() {
    let server = FakeServer::new();
    server.set_online(false);
    let handle = spawn(&server, test_config());

    let data = EntityData::Event(event("Offline gala", Some(20)));
    let created = handle.create(data.clone()).await.expect("create");
    let fetched = handle
        .get_by_id(Collection::Events, created.key.local)
        .await
        .expect("get")
        .expect("stored");

    assert_eq!(fetched.data, data);
    assert_eq!(fetched.key.local, created.key.local);
    assert!(fetched.key.remote.is_none());

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn transient_failures_are_retried_until_confirmed() {
    let server = FakeServer::new();
    server.fail_next(3);
    let handle = spawn(&server, test_config());

    let created = handle
        .create(EntityData::User(user("Bob")))
        .await
        .expect("create");

    let h = handle.clone();
    assert!(eventually(|| {
        let h = h.clone();
        async move { h.pending_count().await.expect("pending") == 0 }
    })
    .await);

    let stored = handle
        .get_by_id(Collection::Users, created.key.local)
        .await
        .expect("get")
        .expect("user");
    assert!(stored.key.remote.is_some());
    assert_eq!(server.records("users").len(), 1);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn sync_now_flushes_dependent_records_in_order() {
    let server = FakeServer::new();
    let handle = spawn(
        &server,
        SyncConfig {
            start_online: false,
            ..test_config()
        },
    );

    let ev = handle
        .create(EntityData::Event(event("Canoe", Some(5))))
        .await
        .expect("event");
    let alice = handle
        .create(EntityData::User(user("Alice")))
        .await
        .expect("user");
    handle
        .book_event(ev.key.local, alice.key.local, BookingDetails::default())
        .await
        .expect("book");
    handle
        .update(
            alice.key.local,
            EntityPatch::User(UserPatch {
                email: Some("alice@lake.example".to_string()),
                ..UserPatch::default()
            }),
        )
        .await
        .expect("update");

    assert_eq!(handle.sync_now().await.expect("offline pass"), 5);
    assert!(server.log().is_empty());

    assert!(handle.set_online(true).await.expect("online"));
    assert_eq!(handle.sync_now().await.expect("pass"), 0);

    let event_remote = handle
        .get_by_id(Collection::Events, ev.key.local)
        .await
        .expect("get")
        .and_then(|e| e.key.remote)
        .expect("event confirmed");
    let user_remote = handle
        .get_by_id(Collection::Users, alice.key.local)
        .await
        .expect("get")
        .and_then(|e| e.key.remote)
        .expect("user confirmed");

    let bookings = server.records("bookings");
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["event_id"], json!(event_remote.as_str()));
    assert_eq!(bookings[0]["user_id"], json!(user_remote.as_str()));

    let server_event = server.record("events", event_remote.as_str()).expect("event");
    assert_eq!(server_event["participants"][0]["user_id"], json!(user_remote.as_str()));
    let server_user = server.record("users", user_remote.as_str()).expect("user");
    assert_eq!(server_user["email"], json!("alice@lake.example"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn same_server_id_in_two_collections_stays_apart() {
    let server = FakeServer::new();
    let handle = spawn(&server, test_config());

    let gala = handle
        .create(EntityData::Event(event("Gala", Some(50))))
        .await
        .expect("event");
    let ann = handle
        .create(EntityData::User(user("Ann")))
        .await
        .expect("user");
    assert_eq!(handle.sync_now().await.expect("pass"), 0);

    let one = EntityId::remote("1");
    let event_copy = handle
        .get_by_id(Collection::Events, one.clone())
        .await
        .expect("get")
        .expect("event by server id");
    let user_copy = handle
        .get_by_id(Collection::Users, one.clone())
        .await
        .expect("get")
        .expect("user by server id");
    assert_eq!(event_copy.key.local, gala.key.local);
    assert_eq!(user_copy.key.local, ann.key.local);

    let report = handle
        .refresh_from_remote(Collection::Users)
        .await
        .expect("refresh users");
    assert_eq!(report.removed, 0);
    assert_eq!(report.inserted, 0);
    let events = handle
        .get_all(Collection::Events, |_| true)
        .await
        .expect("events");
    assert_eq!(events.len(), 1);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failing_pass_reports_what_is_left() {
    let server = FakeServer::new();
    server.set_online(false);
    let handle = spawn(
        &server,
        SyncConfig {
            retry_interval_ms: 60_000,
            ..test_config()
        },
    );

    handle
        .create(EntityData::User(user("Carol")))
        .await
        .expect("create");
    assert_eq!(handle.sync_now().await.expect("pass"), 1);

    server.set_online(true);
    assert_eq!(handle.sync_now().await.expect("pass"), 0);
    assert_eq!(server.count(Method::Post), 1);

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn refresh_pulls_server_records_and_survives_outage() {
    let server = FakeServer::new();
    server.seed("events", "srv-a", json!({ "name": "Alpha", "status": "published" }));
    server.seed("events", "srv-b", json!({ "name": "Beta", "status": "draft" }));
    let handle = spawn(&server, test_config());

    let report = handle
        .refresh_from_remote(Collection::Events)
        .await
        .expect("refresh");
    assert!(report.remote_available);
    assert_eq!(report.inserted, 2);

    server.set_online(false);
    let report = handle
        .refresh_from_remote(Collection::Events)
        .await
        .expect("refresh during outage");
    assert!(!report.remote_available);

    let events = handle
        .get_all(Collection::Events, |_| true)
        .await
        .expect("local events");
    assert_eq!(events.len(), 2);

    let alpha = handle
        .get_by_id(Collection::Events, EntityId::remote("srv-a"))
        .await
        .expect("get")
        .expect("alpha");
    assert_eq!(alpha.as_event().map(|e| e.name.as_str()), Some("Alpha"));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn bus_reports_local_and_sync_activity() {
    let server = FakeServer::new();
    let handle = spawn(&server, test_config());
    let kinds = Arc::new(Mutex::new(Vec::new()));
    for kind in [MessageKind::DbInsert, MessageKind::SyncComplete] {
        let sink = kinds.clone();
        let _sub = handle
            .bus()
            .subscribe(kind, move |m| sink.lock().expect("lock").push(m.kind));
    }

    handle
        .create(EntityData::User(user("Dana")))
        .await
        .expect("create");
    assert_eq!(handle.sync_now().await.expect("pass"), 0);
    handle.bus().flush();

    let kinds = kinds.lock().expect("lock");
    assert_eq!(kinds.first(), Some(&MessageKind::DbInsert));
    assert!(kinds.contains(&MessageKind::SyncComplete));

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn concurrent_callers_share_one_engine() {
    let server = FakeServer::new();
    server.set_online(false);
    let handle = spawn(&server, test_config());

    let mut tasks = Vec::new();
    for i in 0..16 {
        let h = handle.clone();
        tasks.push(tokio::spawn(async move {
            h.create(EntityData::User(user(&format!("User{i}"))))
                .await
                .expect("create")
        }));
    }
    let mut locals = Vec::new();
    for task in tasks {
        locals.push(task.await.expect("join").key.local);
    }
    locals.sort();
    locals.dedup();
    assert_eq!(locals.len(), 16);
    assert_eq!(handle.pending_count().await.expect("pending"), 16);

    handle.shutdown().await.expect("shutdown");
    assert!(handle.pending_count().await.is_err());
}
