use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::{
    bus::message::Priority,
    op::{SyncOpKind, SyncPayload, SyncQueueItem},
    types::{Collection, LocalId},
};

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_ms: u64,
    /// Upper bound on any delay.
    pub max_ms: u64,
}

impl BackoffPolicy {
    /// Delay before the next attempt after `retry_count` failures.
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        if retry_count == 0 {
            return 0;
        }
        let factor = 1u64.checked_shl(retry_count - 1).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }
}

/// FIFO of unconfirmed remote operations.
///
/// Order is preserved per collection and at most one item per collection is
/// in flight at a time.
#[derive(Debug)]
pub struct SyncQueue {
    items: VecDeque<SyncQueueItem>,
    in_flight: HashMap<Collection, u64>,
    next_id: u64,
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            in_flight: HashMap::new(),
            next_id: 1,
        }
    }

    /// Rebuilds a queue from persisted items. Nothing is in flight afterwards.
    pub fn restore(mut items: Vec<SyncQueueItem>) -> Self {
        items.sort_by_key(|item| item.id);
        let next_id = items.last().map_or(1, |item| item.id + 1);
        Self {
            items: items.into(),
            in_flight: HashMap::new(),
            next_id,
        }
    }

    /// Appends an item and returns its id.
    pub fn push(
        &mut self,
        collection: Collection,
        target: LocalId,
        payload: SyncPayload,
        priority: Priority,
        now_ms: u64,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.push_back(SyncQueueItem {
            id,
            collection,
            target,
            payload,
            created_at_ms: now_ms,
            retry_count: 0,
            last_error: None,
            priority,
            next_attempt_ms: now_ms,
        });
        id
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &SyncQueueItem> {
        self.items.iter()
    }

    /// Mutable items in queue order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SyncQueueItem> {
        self.items.iter_mut()
    }

    /// Item with `id`.
    pub fn get(&self, id: u64) -> Option<&SyncQueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Oldest item of `collection`.
    pub fn head(&self, collection: Collection) -> Option<&SyncQueueItem> {
        self.items.iter().find(|item| item.collection == collection)
    }

    /// A record with any queued operation must not be overwritten by a remote fetch.
    pub fn is_dirty(&self, target: LocalId) -> bool {
        self.items.iter().any(|item| item.target == target)
    }

    /// True while the creation of `target` is still queued.
    pub fn has_pending_insert(&self, target: LocalId) -> bool {
        self.items
            .iter()
            .any(|item| item.target == target && item.kind() == SyncOpKind::Insert)
    }

    /// True while `collection` has a request outstanding.
    pub fn is_in_flight(&self, collection: Collection) -> bool {
        self.in_flight.contains_key(&collection)
    }

    /// Collections with a request outstanding.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// True while a creation in `collection` awaits its server response.
    pub fn has_insert_in_flight(&self, collection: Collection) -> bool {
        self.in_flight
            .get(&collection)
            .and_then(|id| self.get(*id))
            .is_some_and(|item| item.kind() == SyncOpKind::Insert)
    }

    /// Marks `id` as the outstanding request of its collection. False when `id` is not queued.
    pub fn mark_in_flight(&mut self, id: u64) -> bool {
        let Some(collection) = self.get(id).map(|item| item.collection) else {
            return false;
        };
        self.in_flight.insert(collection, id);
        true
    }

    /// Clears the outstanding request of `collection`.
    pub fn finish_in_flight(&mut self, collection: Collection) {
        self.in_flight.remove(&collection);
    }

    /// Removes and returns the item with `id`.
    pub fn remove(&mut self, id: u64) -> Option<SyncQueueItem> {
        let pos = self.items.iter().position(|item| item.id == id)?;
        self.items.remove(pos)
    }

    /// Removes every queued item for `target` except one currently in flight.
    pub fn remove_for_target(&mut self, target: LocalId) -> Vec<SyncQueueItem> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            let in_flight = self.in_flight.values().any(|v| *v == item.id);
            if item.target == target && !in_flight {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        removed
    }

    /// Records a failed attempt and schedules the next one. Returns the new retry count.
    pub fn record_failure(
        &mut self,
        id: u64,
        error: String,
        now_ms: u64,
        backoff: &BackoffPolicy,
    ) -> Option<u32> {
        let item = self.items.iter_mut().find(|item| item.id == id)?;
        item.retry_count = item.retry_count.saturating_add(1);
        item.last_error = Some(error);
        item.next_attempt_ms = now_ms.saturating_add(backoff.delay_ms(item.retry_count));
        Some(item.retry_count)
    }
}
