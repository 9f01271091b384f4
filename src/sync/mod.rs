//! Offline-first synchronization: local writes, the retry queue, and
//! reconciliation with the remote authority.

/// Booking and cancellation flows.
pub mod booking;
/// Engine state and local operations.
pub mod engine;
/// Actor task and its cloneable handle.
pub mod handle;
/// Dispatch and merge of remote results.
pub mod reconcile;

pub use booking::{BookingOutcome, CancelOutcome};
pub use engine::{Engine, SyncConfig, SyncError};
pub use handle::{spawn_sync_engine, SyncHandle};
pub use reconcile::{ReconciliationConflict, RefreshReport};
