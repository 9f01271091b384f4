//! Priority publish/subscribe bus decoupling data changes from UI refresh.

/// Queue, subscriber registry, and drain tick.
pub mod dispatcher;
/// Message kinds, priorities, and payloads.
pub mod message;

pub use dispatcher::{BusConfig, Handler, MessageBus, Subscription};
pub use message::{BusMessage, MessageKind, Priority, SourceCategory};
