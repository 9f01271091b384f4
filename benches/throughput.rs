use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use bookingsync::{
    booking::{apply_membership_visibility_limit, BookingDetails},
    bus::{BusConfig, BusMessage, MessageBus, MessageKind, Priority},
    core::status::EventStatus,
    entity::{EntityData, EventData, UserData},
    persist::memory::MemoryStore,
    sync::{Engine, SyncConfig},
    types::{Collection, MembershipTier},
};

fn engine() -> Engine {
    Engine::open(
        Box::new(MemoryStore::new()),
        MessageBus::default(),
        SyncConfig::default(),
    )
    .expect("engine")
}

fn bench_bus_drain(c: &mut Criterion) {
    c.bench_function("bus_publish_drain_10k", |b| {
        b.iter(|| {
            let bus = MessageBus::new(BusConfig {
                tick_ms: 100,
                batch_size: 64,
            });
            let _sub = bus.subscribe(MessageKind::DbUpdate, |_| {});
            for i in 0..10_000u64 {
                let priority = match i % 3 {
                    0 => Priority::High,
                    1 => Priority::Medium,
                    _ => Priority::Low,
                };
                bus.publish(BusMessage::new(MessageKind::DbUpdate, json!({ "i": i })).with_priority(priority));
            }
            bus.flush();
        });
    });
}

fn bench_bookings(c: &mut Criterion) {
    c.bench_function("engine_book_1k", |b| {
        b.iter(|| {
            let mut engine = engine();
            let event = engine
                .create(EntityData::Event(EventData {
                    name: "Bench".to_string(),
                    status: EventStatus::Published,
                    ..EventData::default()
                }))
                .expect("event")
                .id();
            for i in 0..1_000u64 {
                let user = engine
                    .create(EntityData::User(UserData {
                        display_name: format!("U{i}"),
                        ..UserData::default()
                    }))
                    .expect("user")
                    .id();
                let _ = engine
                    .book_event(&event, &user, BookingDetails::default())
                    .expect("book");
            }
        });
    });
}

fn bench_visible_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("visible_listing");
    let mut engine = engine();
    for i in 0..5_000u64 {
        let _ = engine
            .create(EntityData::Event(EventData {
                name: format!("E{i}"),
                status: EventStatus::Published,
                ..EventData::default()
            }))
            .expect("event");
    }

    for tier in [MembershipTier::Visitor, MembershipTier::Registered, MembershipTier::Vip] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{tier:?}")), &tier, |b, &tier| {
            b.iter(|| {
                let events = engine
                    .get_all(Collection::Events, |e| {
                        e.as_event().is_some_and(|d| d.status == EventStatus::Published)
                    })
                    .expect("events");
                let _ = apply_membership_visibility_limit(events, tier);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_bus_drain, bench_bookings, bench_visible_listing);
criterion_main!(benches);
