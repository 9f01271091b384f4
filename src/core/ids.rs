use hashbrown::HashMap;

use crate::types::{Collection, EntityId, LocalId, RemoteId};

/// Bidirectional local/remote identifier table.
///
/// Local ids are unique across collections. Remote ids are only unique within
/// their collection, so lookups by remote id always name the collection.
/// Every cross-entity reference is resolved through this table, so a
/// reference captured before the server assigned an id still finds its target.
#[derive(Debug, Default, Clone)]
pub struct IdTable {
    local_to_remote: HashMap<LocalId, (Collection, RemoteId)>,
    remote_to_local: HashMap<(Collection, RemoteId), LocalId>,
}

impl IdTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the server id for `local`, replacing any previous pairing of either side.
    pub fn assign(&mut self, collection: Collection, local: LocalId, remote: RemoteId) {
        let key = (collection, remote);
        if let Some(old) = self.local_to_remote.insert(local, key.clone()) {
            self.remote_to_local.remove(&old);
        }
        if let Some(old_local) = self.remote_to_local.insert(key, local) {
            if old_local != local {
                self.local_to_remote.remove(&old_local);
            }
        }
    }

    /// Drops both directions of the pairing for `local`.
    pub fn forget(&mut self, local: LocalId) {
        if let Some(key) = self.local_to_remote.remove(&local) {
            self.remote_to_local.remove(&key);
        }
    }

    /// Server id paired with `local`.
    pub fn remote_for(&self, local: LocalId) -> Option<&RemoteId> {
        self.local_to_remote.get(&local).map(|(_, remote)| remote)
    }

    /// Local id paired with `remote` in `collection`.
    pub fn local_for_remote(&self, collection: Collection, remote: &RemoteId) -> Option<LocalId> {
        self.remote_to_local
            .get(&(collection, remote.clone()))
            .copied()
    }

    /// Store key for `id` within `collection`. Local ids map to themselves.
    pub fn local_for(&self, collection: Collection, id: &EntityId) -> Option<LocalId> {
        match id {
            EntityId::Local(local) => Some(*local),
            EntityId::Remote(remote) => self.local_for_remote(collection, remote),
        }
    }

    /// Remote form when known, local form otherwise.
    pub fn canonical(&self, id: &EntityId) -> EntityId {
        match id {
            EntityId::Local(local) => match self.remote_for(*local) {
                Some(remote) => EntityId::Remote(remote.clone()),
                None => id.clone(),
            },
            EntityId::Remote(_) => id.clone(),
        }
    }

    /// True when both references name the same entity. Both must refer into
    /// the same collection.
    pub fn same(&self, a: &EntityId, b: &EntityId) -> bool {
        self.canonical(a) == self.canonical(b)
    }

    /// Number of paired ids.
    pub fn len(&self) -> usize {
        self.local_to_remote.len()
    }

    /// True when no ids are paired.
    pub fn is_empty(&self) -> bool {
        self.local_to_remote.is_empty()
    }
}
