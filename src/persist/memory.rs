//! Non-durable store for tests and ephemeral sessions.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    entity::Entity,
    op::SyncQueueItem,
    types::{Collection, LocalId},
};

use super::{LocalStore, StoreResult};

/// In-memory implementation of [`LocalStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    collections: HashMap<Collection, BTreeMap<LocalId, Entity>>,
    queue: BTreeMap<u64, SyncQueueItem>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records across collections.
    pub fn len(&self) -> usize {
        self.collections.values().map(BTreeMap::len).sum()
    }

    /// True when no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, collection: Collection, id: LocalId) -> StoreResult<Option<Entity>> {
        Ok(self
            .collections
            .get(&collection)
            .and_then(|records| records.get(&id))
            .cloned())
    }

    fn get_all(&self, collection: Collection) -> StoreResult<Vec<Entity>> {
        Ok(self
            .collections
            .get(&collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put(&mut self, entity: Entity) -> StoreResult<Entity> {
        self.collections
            .entry(entity.collection())
            .or_default()
            .insert(entity.key.local, entity.clone());
        Ok(entity)
    }

    fn delete(&mut self, collection: Collection, id: LocalId) -> StoreResult<()> {
        if let Some(records) = self.collections.get_mut(&collection) {
            records.remove(&id);
        }
        Ok(())
    }

    fn put_queue_item(&mut self, item: &SyncQueueItem) -> StoreResult<()> {
        self.queue.insert(item.id, item.clone());
        Ok(())
    }

    fn delete_queue_item(&mut self, id: u64) -> StoreResult<()> {
        self.queue.remove(&id);
        Ok(())
    }

    fn load_queue(&self) -> StoreResult<Vec<SyncQueueItem>> {
        Ok(self.queue.values().cloned().collect())
    }
}
