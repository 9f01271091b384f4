//! Not-yet-confirmed remote operations.

use serde::{Deserialize, Serialize};

use crate::{
    bus::message::Priority,
    entity::{EntityData, EntityPatch},
    types::{Collection, EntityId, LocalId, RemoteId},
};

/// Remote operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOpKind {
    /// Create on the server.
    Insert,
    /// Sparse field update.
    Update,
    /// Removal.
    Delete,
}

impl SyncOpKind {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Body of a queued operation, captured when the local write happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum SyncPayload {
    /// Full record to create.
    Insert(EntityData),
    /// Fields to merge.
    Update(EntityPatch),
    /// Removal. Carries the server id when it was known at delete time, since
    /// the local record and its id mapping are already gone.
    Delete(Option<RemoteId>),
}

impl SyncPayload {
    /// Operation kind.
    pub fn kind(&self) -> SyncOpKind {
        match self {
            Self::Insert(_) => SyncOpKind::Insert,
            Self::Update(_) => SyncOpKind::Update,
            Self::Delete(_) => SyncOpKind::Delete,
        }
    }

    /// Visits every cross-entity reference in the body.
    pub fn map_refs(&mut self, f: impl FnMut(&mut EntityId)) {
        match self {
            Self::Insert(data) => data.map_refs(f),
            Self::Update(patch) => patch.map_refs(f),
            Self::Delete(_) => {}
        }
    }
}

/// Queued remote operation. Internal to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Monotonic queue item id.
    pub id: u64,
    /// Target collection.
    pub collection: Collection,
    /// Target record.
    pub target: LocalId,
    /// Operation body.
    pub payload: SyncPayload,
    /// Enqueue timestamp in milliseconds.
    pub created_at_ms: u64,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Dispatch priority across collections.
    pub priority: Priority,
    /// Earliest time of the next attempt, in milliseconds.
    pub next_attempt_ms: u64,
}

impl SyncQueueItem {
    /// Operation kind.
    pub fn kind(&self) -> SyncOpKind {
        self.payload.kind()
    }
}
