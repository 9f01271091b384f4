//! Local persistence: records plus the queue of unconfirmed remote operations.

/// Non-durable store.
pub mod memory;
/// SQLite-backed store.
pub mod sqlite;

use thiserror::Error;

use crate::{
    entity::Entity,
    op::SyncQueueItem,
    types::{Collection, LocalId},
};

/// Durable-storage malfunction. Always fatal to the calling operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite rejected a statement.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored payload could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else, such as an unknown format version.
    #[error("{0}")]
    Message(String),
}

/// Result of a store call.
pub type StoreResult<T> = Result<T, StoreError>;

/// Per-collection record persistence.
///
/// "Not found" is never an error: `get` returns `None` and `delete` is a no-op.
/// Implementations fail only on storage malfunction.
pub trait LocalStore: Send {
    /// Record keyed by `id`, if present.
    fn get(&self, collection: Collection, id: LocalId) -> StoreResult<Option<Entity>>;
    /// All records of `collection`, ordered by local id.
    fn get_all(&self, collection: Collection) -> StoreResult<Vec<Entity>>;
    /// Inserts or replaces the record keyed by `entity.key.local`.
    fn put(&mut self, entity: Entity) -> StoreResult<Entity>;
    /// Removes the record keyed by `id`.
    fn delete(&mut self, collection: Collection, id: LocalId) -> StoreResult<()>;

    /// Inserts or replaces a queued remote operation, keyed by `item.id`.
    fn put_queue_item(&mut self, item: &SyncQueueItem) -> StoreResult<()>;
    /// Removes a queued remote operation.
    fn delete_queue_item(&mut self, id: u64) -> StoreResult<()>;
    /// Every queued remote operation, ordered by id.
    fn load_queue(&self) -> StoreResult<Vec<SyncQueueItem>>;
}
