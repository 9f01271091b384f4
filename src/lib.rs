//! Offline-first event booking store with a priority message bus and
//! background synchronization to a remote authority.
//!
//! Every write lands in the local store first and is confirmed to the caller
//! immediately. The remote copy catches up through a retry queue.
//!
//! # Examples
//!
//! Local booking with [`sync::Engine`]:
//! ```
//! use bookingsync::{
//!     booking::BookingDetails,
//!     bus::MessageBus,
//!     core::status::EventStatus,
//!     entity::{EntityData, EventData, UserData},
//!     persist::memory::MemoryStore,
//!     sync::{Engine, SyncConfig},
//! };
//!
//! let mut engine = Engine::open(
//!     Box::new(MemoryStore::new()),
//!     MessageBus::default(),
//!     SyncConfig::default(),
//! ).expect("open");
//!
//! let user = engine.create(EntityData::User(UserData::default())).expect("user");
//! let event = engine.create(EntityData::Event(EventData {
//!     name: "Harbour walk".to_string(),
//!     max_participants: Some(1),
//!     status: EventStatus::Published,
//!     ..EventData::default()
//! })).expect("event");
//!
//! let booked = engine
//!     .book_event(&event.id(), &user.id(), BookingDetails::default())
//!     .expect("book");
//! assert_eq!(booked.event.as_event().map(|e| e.status), Some(EventStatus::Full));
//! assert_eq!(engine.pending_count(), 4);
//! ```
//!
//! Running the engine against a remote gateway:
//! ```no_run
//! use std::sync::Arc;
//!
//! use bookingsync::{
//!     bus::MessageBus,
//!     persist::sqlite::SqliteStore,
//!     remote::RemoteGateway,
//!     sync::{spawn_sync_engine, Engine, SyncConfig},
//!     types::Collection,
//! };
//!
//! # async fn run(gateway: Arc<dyn RemoteGateway>) {
//! let store = SqliteStore::open("bookings.db").expect("open sqlite");
//! let bus = MessageBus::default();
//! bus.start();
//! let engine = Engine::open(Box::new(store), bus, SyncConfig::default()).expect("engine");
//! let handle = spawn_sync_engine(engine, gateway);
//! let report = handle.refresh_from_remote(Collection::Events).await.expect("refresh");
//! println!("{} new events", report.inserted);
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![warn(missing_docs)]

/// Booking invariants and membership visibility.
pub mod booking;
/// Priority publish/subscribe bus.
pub mod bus;
/// Identifier table, retry queue, and event lifecycle.
pub mod core;
/// Domain records and sparse patches.
pub mod entity;
/// Queued remote operations.
pub mod op;
/// Local store abstraction with memory and SQLite backends.
pub mod persist;
/// Remote gateway interface and wire format.
pub mod remote;
/// Synchronization engine and its runtime handle.
pub mod sync;
/// Identifiers and shared enums.
pub mod types;
