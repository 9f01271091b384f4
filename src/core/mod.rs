//! Identifier table, retry queue, and event lifecycle.

/// Local/remote identifier lookup.
pub mod ids;
/// FIFO retry queue and backoff policy.
pub mod queue;
/// Event status state machine.
pub mod status;
