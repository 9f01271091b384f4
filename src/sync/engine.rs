use hashbrown::HashMap;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    booking::rules::{check_transition, validate_event, InvariantViolation},
    bus::{BusMessage, MessageBus, MessageKind, Priority, SourceCategory},
    core::{
        ids::IdTable,
        queue::{BackoffPolicy, SyncQueue},
        status::EventStatus,
    },
    entity::{BookingPatch, Entity, EntityData, EntityPatch, EventPatch},
    op::{SyncPayload, SyncQueueItem},
    persist::{LocalStore, StoreError},
    types::{now_ms, Collection, EntityId, EntityKey, LocalId, RemoteId},
};

/// Caller-visible failure. Remote failures never appear here.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The local store failed; nothing was changed.
    #[error("local store failure: {0}")]
    Store(#[from] StoreError),
    /// A booking or lifecycle rule rejected the operation.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    /// No record with this id in the collection.
    #[error("{collection} record {id} not found")]
    NotFound {
        /// Collection searched.
        collection: Collection,
        /// Id as given by the caller.
        id: EntityId,
    },
    /// The engine task has stopped.
    #[error("sync engine is not running")]
    ChannelClosed,
}

impl SyncError {
    /// The rule violation, if this is one.
    pub fn invariant(&self) -> Option<&InvariantViolation> {
        match self {
            Self::Invariant(v) => Some(v),
            _ => None,
        }
    }
}

/// Engine tuning. Every field has a default, so partial config files load.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval of the background retry sweep.
    pub retry_interval_ms: u64,
    /// First retry delay; doubles per failure.
    pub backoff_base_ms: u64,
    /// Ceiling for the retry delay.
    pub backoff_max_ms: u64,
    /// Consecutive failures after which `SYNC_FAILED` is published.
    pub failure_notify_after: u32,
    /// Upper bound for one remote call.
    pub request_timeout_ms: u64,
    /// Capacity of the command channel in front of the engine task.
    pub command_queue_bound: usize,
    /// Initial network state.
    pub start_online: bool,
    /// Forwarded to the gateway with every request.
    pub auth_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1_000,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            failure_notify_after: 5,
            request_timeout_ms: 10_000,
            command_queue_bound: 256,
            start_online: true,
            auth_token: None,
        }
    }
}

impl SyncConfig {
    /// Retry delay policy built from the backoff fields.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: self.backoff_base_ms,
            max_ms: self.backoff_max_ms,
        }
    }
}

/// Local writes of one logical operation, undone together on failure.
#[derive(Default)]
pub(super) struct Txn {
    undo: Vec<Undo>,
    effects: Vec<Effect>,
}

enum Undo {
    Restore(Entity),
    Remove(Collection, LocalId),
}

enum Effect {
    Inserted(Entity),
    Updated(Entity, EntityPatch),
    Deleted(Entity),
}

/// Single-writer synchronization state: local store, identifier table,
/// retry queue, and tombstones.
///
/// Every method completes its local work synchronously. Remote traffic is
/// driven by [`crate::sync::handle::spawn_sync_engine`].
pub struct Engine {
    pub(super) store: Box<dyn LocalStore>,
    pub(super) bus: MessageBus,
    pub(super) ids: IdTable,
    pub(super) queue: SyncQueue,
    /// Locally deleted server records, with the time the server confirmed
    /// the delete once it has.
    pub(super) tombstones: HashMap<(Collection, RemoteId), Option<u64>>,
    pub(super) online: bool,
    pub(super) config: SyncConfig,
    next_local: u64,
}

impl Engine {
    /// Rebuilds the identifier table, the retry queue, and the local id
    /// allocator from `store`.
    pub fn open(
        store: Box<dyn LocalStore>,
        bus: MessageBus,
        config: SyncConfig,
    ) -> Result<Self, StoreError> {
        let mut ids = IdTable::new();
        let mut max_local = 0;
        for collection in Collection::ALL {
            for entity in store.get_all(collection)? {
                max_local = max_local.max(entity.key.local.0);
                if let Some(remote) = &entity.key.remote {
                    ids.assign(collection, entity.key.local, remote.clone());
                }
            }
        }

        let items = store.load_queue()?;
        let mut tombstones = HashMap::new();
        for item in &items {
            max_local = max_local.max(item.target.0);
            if let SyncPayload::Delete(Some(remote)) = &item.payload {
                tombstones.insert((item.collection, remote.clone()), None);
            }
        }
        let queue = SyncQueue::restore(items);
        debug!(
            known_remote = ids.len(),
            pending = queue.len(),
            next_local = max_local + 1,
            "sync engine opened"
        );

        Ok(Self {
            store,
            bus,
            ids,
            queue,
            tombstones,
            online: config.start_online,
            config,
            next_local: max_local + 1,
        })
    }

    /// Bus the engine publishes on.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Local/remote identifier pairs known so far.
    pub fn ids(&self) -> &IdTable {
        &self.ids
    }

    /// Unconfirmed remote operations, for diagnostics.
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// Queued remote operations, including one in flight.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Whether remote calls are currently attempted.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Replaces the bearer token sent with later requests.
    pub fn set_auth_token(&mut self, token: Option<String>) {
        self.config.auth_token = token;
    }

    /// Switches network state. Going online makes every queued item due now.
    pub fn set_online(&mut self, online: bool) -> bool {
        if self.online == online {
            return false;
        }
        self.online = online;
        let kind = if online {
            let now = now_ms();
            for item in self.queue.iter_mut() {
                item.next_attempt_ms = now;
            }
            MessageKind::NetworkOnline
        } else {
            MessageKind::NetworkOffline
        };
        self.bus.publish(
            BusMessage::new(kind, json!({ "pending": self.queue.len() }))
                .with_priority(Priority::High)
                .with_source(SourceCategory::Network),
        );
        true
    }

    pub(super) fn allocate_local(&mut self) -> LocalId {
        let id = LocalId(self.next_local);
        self.next_local += 1;
        id
    }

    /// Record of `collection` named by either identifier.
    pub fn get_by_id(&self, collection: Collection, id: &EntityId) -> Result<Option<Entity>, SyncError> {
        let Some(local) = self.ids.local_for(collection, id) else {
            return Ok(None);
        };
        Ok(self.store.get(collection, local)?)
    }

    /// Records of `collection` accepted by `filter`, ordered by local id.
    pub fn get_all(
        &self,
        collection: Collection,
        filter: impl Fn(&Entity) -> bool,
    ) -> Result<Vec<Entity>, SyncError> {
        Ok(self
            .store
            .get_all(collection)?
            .into_iter()
            .filter(|entity| filter(entity))
            .collect())
    }

    pub(super) fn resolve(&self, collection: Collection, id: &EntityId) -> Result<Entity, SyncError> {
        self.get_by_id(collection, id)?.ok_or_else(|| SyncError::NotFound {
            collection,
            id: id.clone(),
        })
    }

    /// Writes a new record locally and queues its remote creation.
    ///
    /// Bookings go through the same capacity and duplicate checks as
    /// [`Engine::book_event`] and add the matching participant.
    pub fn create(&mut self, data: EntityData) -> Result<Entity, SyncError> {
        let data = match data {
            EntityData::Booking(booking) => return self.create_booking(booking).map(|out| out.booking),
            data => data,
        };

        let key = EntityKey::local(self.allocate_local());
        if let EntityData::Event(event) = &data {
            validate_event(&key.id(), event, &self.ids)?;
        }
        let now = now_ms();
        let entity = Entity {
            key,
            created_at_ms: now,
            updated_at_ms: now,
            data,
        };
        self.run_txn(|engine, txn| engine.txn_insert(txn, entity))
    }

    /// Merges `patch` into the record. Fields absent from the patch are kept.
    pub fn update(&mut self, id: &EntityId, patch: EntityPatch) -> Result<Entity, SyncError> {
        let before = self.resolve(patch.collection(), id)?;
        match patch {
            EntityPatch::Event(patch) => self.update_event(before, patch),
            EntityPatch::Booking(patch) => self.update_booking(before, patch),
            patch @ EntityPatch::User(_) => {
                self.run_txn(|engine, txn| engine.txn_update(txn, before, patch))
            }
        }
    }

    /// Requests an event status change; rejected unless allowed from the current state.
    pub fn transition_status(&mut self, event_id: &EntityId, to: EventStatus) -> Result<Entity, SyncError> {
        self.update(
            event_id,
            EntityPatch::Event(EventPatch {
                status: Some(to),
                ..EventPatch::default()
            }),
        )
    }

    fn update_event(&mut self, before: Entity, patch: EventPatch) -> Result<Entity, SyncError> {
        let current = before
            .as_event()
            .cloned()
            .ok_or(InvariantViolation::CollectionMismatch {
                expected: Collection::Events,
                actual: before.collection(),
            })?;
        if let Some(to) = patch.status {
            check_transition(current.status, to)?;
        }

        let mut next = current.clone();
        patch.apply_to(&mut next);
        validate_event(&before.id(), &next, &self.ids)?;

        let removed: Vec<EntityId> = current
            .participants
            .iter()
            .filter(|p| p.is_active())
            .filter(|p| {
                !next
                    .participants
                    .iter()
                    .any(|n| n.is_active() && self.ids.same(&n.user_id, &p.user_id))
            })
            .map(|p| p.user_id.clone())
            .collect();

        self.run_txn(|engine, txn| {
            let after = engine.txn_update(txn, before, EntityPatch::Event(patch))?;
            for user_id in &removed {
                if let Some(booking) = engine.find_booking(&after.id(), user_id)? {
                    engine.txn_update(txn, booking, cancel_patch())?;
                }
            }
            Ok(after)
        })
    }

    fn update_booking(&mut self, before: Entity, patch: BookingPatch) -> Result<Entity, SyncError> {
        let current = before
            .as_booking()
            .cloned()
            .ok_or(InvariantViolation::CollectionMismatch {
                expected: Collection::Bookings,
                actual: before.collection(),
            })?;

        use crate::entity::BookingStatus::*;
        match (current.status, patch.status) {
            (Cancelled, Some(to)) if to != Cancelled => Err(InvariantViolation::InvalidRecord(
                "a cancelled booking cannot be reopened".to_string(),
            )
            .into()),
            (from, Some(Cancelled)) if from != Cancelled => {
                let event = self.find_event(&current.event_id)?;
                self.run_txn(|engine, txn| {
                    if let Some(event) = event {
                        engine.txn_remove_participant(txn, event, &current.user_id)?;
                    }
                    engine.txn_update(txn, before, EntityPatch::Booking(patch))
                })
            }
            (from, Some(Confirmed)) if from != Confirmed => {
                let event = self.find_event(&current.event_id)?;
                self.run_txn(|engine, txn| {
                    if let Some(event) = event {
                        engine.txn_confirm_participant(txn, event, &current.user_id)?;
                    }
                    engine.txn_update(txn, before, EntityPatch::Booking(patch))
                })
            }
            _ => self.run_txn(|engine, txn| engine.txn_update(txn, before, EntityPatch::Booking(patch))),
        }
    }

    /// Removes the record locally and queues its remote deletion.
    ///
    /// Returns false when no such record exists. Deleting a booking frees its
    /// seat; deleting an event cancels its bookings.
    pub fn delete(&mut self, collection: Collection, id: &EntityId) -> Result<bool, SyncError> {
        let Some(before) = self.get_by_id(collection, id)? else {
            return Ok(false);
        };

        match collection {
            Collection::Bookings => {
                let booking = before.as_booking().cloned();
                let event = match &booking {
                    Some(b) if b.status != crate::entity::BookingStatus::Cancelled => {
                        self.find_event(&b.event_id)?
                    }
                    _ => None,
                };
                self.run_txn(|engine, txn| {
                    if let (Some(event), Some(booking)) = (event, &booking) {
                        engine.txn_remove_participant(txn, event, &booking.user_id)?;
                    }
                    engine.txn_delete(txn, before)
                })?;
            }
            Collection::Events => {
                let event_id = before.id();
                let bookings = self.bookings_for_event(&event_id)?;
                self.run_txn(|engine, txn| {
                    engine.txn_delete(txn, before)?;
                    for booking in bookings {
                        engine.txn_update(txn, booking, cancel_patch())?;
                    }
                    Ok(())
                })?;
            }
            Collection::Users => {
                self.run_txn(|engine, txn| engine.txn_delete(txn, before))?;
            }
        }
        Ok(true)
    }

    /// Drops queued operations for a record, except one already in flight.
    pub fn discard_pending(&mut self, collection: Collection, id: &EntityId) -> Result<usize, SyncError> {
        let local = self.ids.local_for(collection, id).ok_or_else(|| SyncError::NotFound {
            collection,
            id: id.clone(),
        })?;
        let removed = self.drop_pending(local);
        debug!(%collection, local_id = local.0, removed = removed.len(), "discarded pending sync items");
        Ok(removed.len())
    }

    pub(super) fn find_event(&self, event_id: &EntityId) -> Result<Option<Entity>, SyncError> {
        self.get_by_id(Collection::Events, event_id)
    }

    /// Non-cancelled booking of `user_id` on `event_id`.
    pub(super) fn find_booking(&self, event_id: &EntityId, user_id: &EntityId) -> Result<Option<Entity>, SyncError> {
        Ok(self.bookings_for_event(event_id)?.into_iter().find(|entity| {
            entity
                .as_booking()
                .is_some_and(|b| self.ids.same(&b.user_id, user_id))
        }))
    }

    /// Non-cancelled bookings of `event_id`.
    pub(super) fn bookings_for_event(&self, event_id: &EntityId) -> Result<Vec<Entity>, SyncError> {
        self.get_all(Collection::Bookings, |entity| {
            entity.as_booking().is_some_and(|b| {
                b.status != crate::entity::BookingStatus::Cancelled && self.ids.same(&b.event_id, event_id)
            })
        })
    }

    pub(super) fn run_txn<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut Txn) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut txn = Txn::default();
        match f(self, &mut txn) {
            Ok(out) => {
                self.commit(txn.effects);
                Ok(out)
            }
            Err(err) => {
                self.rollback(txn.undo);
                Err(err)
            }
        }
    }

    pub(super) fn txn_insert(&mut self, txn: &mut Txn, entity: Entity) -> Result<Entity, SyncError> {
        let stored = self.store.put(entity)?;
        txn.undo.push(Undo::Remove(stored.collection(), stored.key.local));
        txn.effects.push(Effect::Inserted(stored.clone()));
        Ok(stored)
    }

    pub(super) fn txn_update(
        &mut self,
        txn: &mut Txn,
        before: Entity,
        patch: EntityPatch,
    ) -> Result<Entity, SyncError> {
        let mut after = before.clone();
        if !patch.apply_to(&mut after.data) {
            return Err(InvariantViolation::CollectionMismatch {
                expected: before.collection(),
                actual: patch.collection(),
            }
            .into());
        }
        after.updated_at_ms = now_ms();
        let stored = self.store.put(after)?;
        txn.undo.push(Undo::Restore(before));
        txn.effects.push(Effect::Updated(stored.clone(), patch));
        Ok(stored)
    }

    pub(super) fn txn_delete(&mut self, txn: &mut Txn, before: Entity) -> Result<(), SyncError> {
        self.store.delete(before.collection(), before.key.local)?;
        txn.undo.push(Undo::Restore(before.clone()));
        txn.effects.push(Effect::Deleted(before));
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match step {
                Undo::Restore(entity) => self.store.put(entity).map(|_| ()),
                Undo::Remove(collection, local) => self.store.delete(collection, local),
            };
            if let Err(err) = result {
                error!(%err, "rollback step failed, local store may hold a partial write");
            }
        }
    }

    fn commit(&mut self, effects: Vec<Effect>) {
        let now = now_ms();
        for effect in effects {
            match effect {
                Effect::Inserted(entity) => {
                    self.publish_record(MessageKind::DbInsert, &entity);
                    let collection = entity.collection();
                    self.enqueue(collection, entity.key.local, SyncPayload::Insert(entity.data), now);
                }
                Effect::Updated(entity, patch) => {
                    self.publish_record(MessageKind::DbUpdate, &entity);
                    if !patch.is_empty() {
                        self.enqueue(entity.collection(), entity.key.local, SyncPayload::Update(patch), now);
                    }
                }
                Effect::Deleted(entity) => {
                    self.publish_record(MessageKind::DbDelete, &entity);
                    self.enqueue_delete(&entity, now);
                }
            }
        }
    }

    fn enqueue_delete(&mut self, entity: &Entity, now: u64) {
        let local = entity.key.local;
        let collection = entity.collection();
        let dropped = self.drop_pending(local);
        match &entity.key.remote {
            Some(remote) => {
                self.tombstones.insert((collection, remote.clone()), None);
            }
            None => {
                let insert_dropped = dropped.iter().any(|item| matches!(item.payload, SyncPayload::Insert(_)));
                if insert_dropped {
                    debug!(local_id = local.0, "record never reached the server, no remote delete needed");
                    return;
                }
            }
        }
        self.enqueue(collection, local, SyncPayload::Delete(entity.key.remote.clone()), now);
    }

    /// Queues a remote operation and writes it through to the store.
    pub(super) fn enqueue(&mut self, collection: Collection, target: LocalId, payload: SyncPayload, now: u64) {
        let id = self.queue.push(collection, target, payload, queue_priority(collection), now);
        self.persist_queue_item(id);
    }

    /// Removes a queued item from memory and from the store.
    pub(super) fn dequeue(&mut self, item_id: u64) -> Option<SyncQueueItem> {
        let item = self.queue.remove(item_id)?;
        if let Err(err) = self.store.delete_queue_item(item_id) {
            error!(%err, item_id, "failed to remove persisted sync item");
        }
        Some(item)
    }

    /// Drops every queued item for `target` except one in flight.
    pub(super) fn drop_pending(&mut self, target: LocalId) -> Vec<SyncQueueItem> {
        let removed = self.queue.remove_for_target(target);
        for item in &removed {
            if let Err(err) = self.store.delete_queue_item(item.id) {
                error!(%err, item_id = item.id, "failed to remove persisted sync item");
            }
        }
        removed
    }

    /// Writes the current state of a queued item to the store.
    ///
    /// The in-memory queue stays authoritative for this session when the
    /// write fails.
    pub(super) fn persist_queue_item(&mut self, item_id: u64) {
        let Some(item) = self.queue.get(item_id) else {
            return;
        };
        if let Err(err) = self.store.put_queue_item(item) {
            error!(%err, item_id, "failed to persist sync item");
        }
    }

    pub(super) fn publish_record(&self, kind: MessageKind, entity: &Entity) {
        self.bus.publish(
            BusMessage::new(
                kind,
                json!({
                    "collection": entity.collection(),
                    "id": entity.id(),
                    "local_id": entity.key.local,
                }),
            )
            .with_source(SourceCategory::LocalStore),
        );
    }
}

pub(super) fn cancel_patch() -> EntityPatch {
    EntityPatch::Booking(BookingPatch {
        status: Some(crate::entity::BookingStatus::Cancelled),
        ..BookingPatch::default()
    })
}

fn queue_priority(collection: Collection) -> Priority {
    match collection {
        Collection::Bookings => Priority::High,
        Collection::Events | Collection::Users => Priority::Medium,
    }
}
