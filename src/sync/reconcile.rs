//! Remote side of the engine: which queued items are sent next, and how
//! server responses are folded back into local state.

use hashbrown::HashSet;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{BusMessage, MessageKind, Priority, SourceCategory},
    entity::{Entity, EntityData},
    op::{SyncOpKind, SyncPayload, SyncQueueItem},
    remote::{
        wire::{
            collection_path, decode_data, decode_record, decode_remote_id, encode_data, encode_patch, entity_path,
            normalize_server_refs,
        },
        Method, RemoteError, RemoteRequest,
    },
    types::{now_ms, Collection, EntityId, EntityKey, LocalId, RemoteId},
};

use super::engine::{Engine, SyncError};

/// A record whose server copy was not applied because local edits are pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationConflict {
    /// Collection of the record.
    pub collection: Collection,
    /// Local key of the record that kept its local state.
    pub local: LocalId,
    /// Server id of the skipped server copy.
    pub remote: RemoteId,
}

/// Result of [`Engine::merge_remote`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefreshReport {
    /// Collection that was refreshed.
    pub collection: Option<Collection>,
    /// False when the fetch itself failed; local data was left untouched.
    pub remote_available: bool,
    /// Server records new to the local store.
    pub inserted: usize,
    /// Local records replaced by a newer server copy.
    pub updated: usize,
    /// Server records that matched, or local records changed after the fetch began.
    pub unchanged: usize,
    /// Clean local records the server no longer lists.
    pub removed: usize,
    /// Undecodable or locally deleted server records, and new records held
    /// back while a creation in the same collection awaits its response.
    pub skipped: usize,
    /// Records whose local edits were kept over the server copy.
    pub conflicts: Vec<ReconciliationConflict>,
}

/// Collections that failed during a forced sync pass.
#[derive(Debug, Default)]
pub struct SyncPass {
    pub(crate) failed: HashSet<Collection>,
}

/// A queued item ready to go out.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Queue item the request was built from.
    pub item_id: u64,
    /// Collection of the target record.
    pub collection: Collection,
    /// Request to send.
    pub request: RemoteRequest,
}

enum Prepared {
    Ready(RemoteRequest),
    /// References a record whose creation is not confirmed yet.
    Blocked,
    /// Nothing left to send for this item.
    Obsolete,
}

impl Engine {
    /// Picks the next request per idle collection and marks it in flight.
    ///
    /// Within a pass, backoff is ignored and collections that already failed
    /// are skipped.
    pub fn next_dispatches(&mut self, now: u64, pass: Option<&SyncPass>) -> Vec<Dispatch> {
        let mut out = Vec::new();
        if !self.online {
            return out;
        }

        let mut collections = Collection::ALL.to_vec();
        collections.sort_by_key(|c| {
            self.queue
                .head(*c)
                .map_or((u8::MAX, u64::MAX), |head| (head.priority.rank(), head.id))
        });

        for collection in collections {
            if self.queue.is_in_flight(collection) {
                continue;
            }
            if pass.is_some_and(|p| p.failed.contains(&collection)) {
                continue;
            }
            while let Some(head) = self.queue.head(collection) {
                if pass.is_none() && head.next_attempt_ms > now {
                    break;
                }
                let item_id = head.id;
                match self.prepare(head) {
                    Prepared::Ready(request) => {
                        self.queue.mark_in_flight(item_id);
                        out.push(Dispatch {
                            item_id,
                            collection,
                            request,
                        });
                        break;
                    }
                    Prepared::Blocked => break,
                    Prepared::Obsolete => {
                        debug!(item_id, %collection, "dropping obsolete sync item");
                        self.dequeue(item_id);
                    }
                }
            }
        }
        out
    }

    fn prepare(&self, item: &SyncQueueItem) -> Prepared {
        let target_remote = self.ids.remote_for(item.target).cloned();
        let mut payload = item.payload.clone();
        if !self.resolve_refs(&mut payload) {
            return Prepared::Blocked;
        }

        let request = match (payload, target_remote) {
            (SyncPayload::Insert(_), Some(_)) => return Prepared::Obsolete,
            (SyncPayload::Insert(data), None) => encode_data(&data).map(|body| RemoteRequest {
                method: Method::Post,
                path: collection_path(item.collection),
                body: Some(body),
            }),
            (SyncPayload::Update(patch), Some(remote)) => encode_patch(&patch).map(|body| RemoteRequest {
                method: Method::Put,
                path: entity_path(item.collection, &remote),
                body: Some(body),
            }),
            (SyncPayload::Delete(Some(remote)), _) | (SyncPayload::Delete(None), Some(remote)) => {
                Ok(RemoteRequest {
                    method: Method::Delete,
                    path: entity_path(item.collection, &remote),
                    body: None,
                })
            }
            (_, None) if self.queue.has_pending_insert(item.target) => return Prepared::Blocked,
            (_, None) => return Prepared::Obsolete,
        };

        match request {
            Ok(request) => Prepared::Ready(request),
            Err(err) => {
                error!(%err, item_id = item.id, "failed to encode sync item");
                Prepared::Obsolete
            }
        }
    }

    /// Rewrites local references to server ids. False while any referenced
    /// record still waits for its creation to be confirmed.
    fn resolve_refs(&self, payload: &mut SyncPayload) -> bool {
        let mut ready = true;
        payload.map_refs(|id| {
            if let EntityId::Local(local) = id {
                match self.ids.remote_for(*local) {
                    Some(remote) => *id = EntityId::Remote(remote.clone()),
                    None => {
                        if self.queue.has_pending_insert(*local) {
                            ready = false;
                        }
                    }
                }
            }
        });
        ready
    }

    /// Applies the outcome of a dispatched item. Returns true on success.
    pub fn on_sync_result(
        &mut self,
        item_id: u64,
        collection: Collection,
        result: Result<Value, RemoteError>,
    ) -> bool {
        self.queue.finish_in_flight(collection);
        let Some(kind) = self.queue.get(item_id).map(|item| item.kind()) else {
            debug!(item_id, "result for a discarded sync item");
            return result.is_ok();
        };

        let result = result.and_then(|body| match kind {
            SyncOpKind::Insert if decode_remote_id(&body).is_none() => Err(RemoteError::Decode(
                "insert confirmation without id".to_string(),
            )),
            _ => Ok(body),
        });

        match result {
            Ok(body) => {
                let Some(item) = self.dequeue(item_id) else {
                    return true;
                };
                let confirmed = match kind {
                    SyncOpKind::Insert => self.confirm_insert(&item, &body),
                    SyncOpKind::Update => Ok(()),
                    SyncOpKind::Delete => {
                        self.confirm_delete(&item);
                        Ok(())
                    }
                };
                if let Err(err) = confirmed {
                    error!(%err, item_id, "failed to apply server confirmation locally");
                }
                debug!(item_id, %collection, op = kind.as_str(), "sync item confirmed");
                self.bus.publish(
                    BusMessage::new(
                        MessageKind::SyncComplete,
                        json!({
                            "collection": collection,
                            "op": kind.as_str(),
                            "local_id": item.target,
                            "remote_id": self.ids.remote_for(item.target),
                        }),
                    )
                    .with_priority(Priority::Low)
                    .with_source(SourceCategory::Network),
                );
                true
            }
            Err(err) => {
                let backoff = self.config.backoff();
                let Some(retries) = self.queue.record_failure(item_id, err.to_string(), now_ms(), &backoff) else {
                    return false;
                };
                self.persist_queue_item(item_id);
                warn!(item_id, %collection, retries, %err, "sync attempt failed");
                if retries == self.config.failure_notify_after {
                    let target = self.queue.get(item_id).map(|item| item.target);
                    self.bus.publish(
                        BusMessage::new(
                            MessageKind::SyncFailed,
                            json!({
                                "collection": collection,
                                "op": kind.as_str(),
                                "local_id": target,
                                "retry_count": retries,
                                "error": err.to_string(),
                            }),
                        )
                        .with_priority(Priority::Low)
                        .with_source(SourceCategory::Network),
                    );
                }
                false
            }
        }
    }

    fn confirm_insert(&mut self, item: &SyncQueueItem, body: &Value) -> Result<(), SyncError> {
        let Some(remote) = decode_remote_id(body) else {
            return Ok(());
        };
        let collection = item.collection;
        let local = item.target;
        if let Some(other) = self
            .ids
            .local_for_remote(collection, &remote)
            .filter(|other| *other != local)
        {
            self.drop_duplicate(collection, other, &remote)?;
        }
        self.ids.assign(collection, local, remote.clone());
        self.repoint_references(local, &remote)?;

        let Some(mut entity) = self.store.get(collection, local)? else {
            // Deleted while the insert was in flight; the queued delete now has its target.
            self.tombstones.insert((collection, remote.clone()), None);
            let mut deletes = Vec::new();
            for queued in self.queue.iter_mut() {
                if queued.target == local && queued.payload == SyncPayload::Delete(None) {
                    queued.payload = SyncPayload::Delete(Some(remote.clone()));
                    deletes.push(queued.id);
                }
            }
            for id in deletes {
                self.persist_queue_item(id);
            }
            return Ok(());
        };

        entity.key.remote = Some(remote);
        if !self.queue.is_dirty(local) {
            match overlay_server_fields(&entity.data, body) {
                Ok(data) => entity.data = data,
                Err(err) => warn!(%err, local_id = local.0, "keeping local copy of confirmed record"),
            }
        }
        entity.updated_at_ms = now_ms();
        let entity = self.store.put(entity)?;
        self.publish_record(MessageKind::DbUpdate, &entity);
        Ok(())
    }

    /// Removes a second local copy of a server record, fetched by a refresh
    /// before the creation that produced it was confirmed.
    fn drop_duplicate(&mut self, collection: Collection, local: LocalId, remote: &RemoteId) -> Result<(), SyncError> {
        warn!(%collection, local_id = local.0, %remote, "dropping duplicate local copy of confirmed record");
        self.drop_pending(local);
        self.ids.forget(local);
        if let Some(entity) = self.store.get(collection, local)? {
            self.store.delete(collection, local)?;
            self.publish_record(MessageKind::DbDelete, &entity);
        }
        Ok(())
    }

    fn confirm_delete(&mut self, item: &SyncQueueItem) {
        let remote = match &item.payload {
            SyncPayload::Delete(Some(remote)) => Some(remote.clone()),
            _ => self.ids.remote_for(item.target).cloned(),
        };
        if let Some(remote) = remote {
            self.tombstones.insert((item.collection, remote), Some(now_ms()));
        }
        self.ids.forget(item.target);
    }

    /// Replaces `local` with `remote` in stored references and queued payloads.
    fn repoint_references(&mut self, local: LocalId, remote: &RemoteId) -> Result<(), SyncError> {
        let from = EntityId::Local(local);
        let to = EntityId::Remote(remote.clone());

        for collection in [Collection::Events, Collection::Bookings] {
            for mut entity in self.store.get_all(collection)? {
                let mut changed = false;
                entity.data.map_refs(|id| {
                    if *id == from {
                        *id = to.clone();
                        changed = true;
                    }
                });
                if changed {
                    self.store.put(entity)?;
                }
            }
        }
        let mut touched = Vec::new();
        for item in self.queue.iter_mut() {
            let mut changed = false;
            item.payload.map_refs(|id| {
                if *id == from {
                    *id = to.clone();
                    changed = true;
                }
            });
            if changed {
                touched.push(item.id);
            }
        }
        for id in touched {
            self.persist_queue_item(id);
        }
        Ok(())
    }

    /// Merges a fetched collection into the local store.
    ///
    /// Records with queued local operations keep their local state and are
    /// reported as conflicts. Locally deleted records stay deleted. Clean
    /// records the server no longer lists are removed, unless they changed
    /// after `fetch_started_ms`. Unknown server records are held back while a
    /// creation in the collection is in flight, since one of them may be its
    /// server copy.
    pub fn merge_remote(
        &mut self,
        collection: Collection,
        records: Vec<Value>,
        fetch_started_ms: u64,
    ) -> Result<RefreshReport, SyncError> {
        let mut report = RefreshReport {
            collection: Some(collection),
            remote_available: true,
            ..RefreshReport::default()
        };
        let now = now_ms();
        let mut seen: HashSet<RemoteId> = HashSet::new();
        // Deletes confirmed before this fetch began cannot be in its results.
        self.tombstones.retain(|(c, _), confirmed_at| {
            *c != collection || confirmed_at.is_none_or(|at| at >= fetch_started_ms)
        });

        for body in records {
            let (remote, data) = match decode_record(collection, &body) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(%err, "skipping undecodable server record");
                    report.skipped += 1;
                    continue;
                }
            };
            seen.insert(remote.clone());
            if self.tombstones.contains_key(&(collection, remote.clone())) {
                report.skipped += 1;
                continue;
            }

            let Some(local) = self.ids.local_for_remote(collection, &remote) else {
                if self.queue.has_insert_in_flight(collection) {
                    debug!(%collection, %remote, "holding back unknown record until the pending creation is confirmed");
                    report.skipped += 1;
                    continue;
                }
                let key = EntityKey {
                    local: self.allocate_local(),
                    remote: Some(remote.clone()),
                };
                self.ids.assign(collection, key.local, remote);
                let entity = self.store.put(Entity {
                    key,
                    created_at_ms: now,
                    updated_at_ms: now,
                    data,
                })?;
                self.publish_record(MessageKind::DbInsert, &entity);
                report.inserted += 1;
                continue;
            };

            if self.queue.is_dirty(local) {
                report.conflicts.push(ReconciliationConflict {
                    collection,
                    local,
                    remote,
                });
                continue;
            }

            match self.store.get(collection, local)? {
                Some(entity) if entity.data == data || entity.updated_at_ms > fetch_started_ms => {
                    report.unchanged += 1;
                }
                Some(mut entity) => {
                    entity.data = data;
                    entity.updated_at_ms = now;
                    let entity = self.store.put(entity)?;
                    self.publish_record(MessageKind::DbUpdate, &entity);
                    report.updated += 1;
                }
                None => {
                    let entity = self.store.put(Entity {
                        key: EntityKey {
                            local,
                            remote: Some(remote),
                        },
                        created_at_ms: now,
                        updated_at_ms: now,
                        data,
                    })?;
                    self.publish_record(MessageKind::DbInsert, &entity);
                    report.inserted += 1;
                }
            }
        }

        for entity in self.store.get_all(collection)? {
            let Some(remote) = &entity.key.remote else {
                continue;
            };
            let local = entity.key.local;
            if seen.contains(remote) || self.queue.is_dirty(local) || entity.updated_at_ms > fetch_started_ms {
                continue;
            }
            self.store.delete(collection, local)?;
            self.ids.forget(local);
            self.publish_record(MessageKind::DbDelete, &entity);
            report.removed += 1;
        }

        if !report.conflicts.is_empty() {
            warn!(%collection, conflicts = report.conflicts.len(), "kept local state for records with pending edits");
        }
        info!(
            %collection,
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            "merged remote collection"
        );
        self.publish_refresh(&report);
        Ok(report)
    }

    /// Reports a failed fetch. Local data is left as is.
    pub fn refresh_failed(&mut self, collection: Collection, err: &RemoteError) -> RefreshReport {
        warn!(%collection, %err, "remote refresh failed, serving local data");
        let report = RefreshReport {
            collection: Some(collection),
            remote_available: false,
            ..RefreshReport::default()
        };
        self.bus.publish(
            BusMessage::new(
                MessageKind::SyncFailed,
                json!({ "collection": collection, "op": "refresh", "error": err.to_string() }),
            )
            .with_priority(Priority::Low)
            .with_source(SourceCategory::Network),
        );
        report
    }

    fn publish_refresh(&self, report: &RefreshReport) {
        self.bus.publish(
            BusMessage::new(
                MessageKind::DbSync,
                json!({
                    "collection": report.collection,
                    "inserted": report.inserted,
                    "updated": report.updated,
                    "removed": report.removed,
                    "conflicts": report.conflicts.len(),
                }),
            )
            .with_priority(Priority::Low)
            .with_source(SourceCategory::Network),
        );
    }
}

/// Server fields layered over the local record, so partial responses keep local values.
fn overlay_server_fields(local: &EntityData, body: &Value) -> Result<EntityData, RemoteError> {
    let collection = local.collection();
    let mut merged = encode_data(local)?;
    let mut server = body.clone();
    normalize_server_refs(collection, &mut server);
    if let (Value::Object(target), Value::Object(server)) = (&mut merged, &server) {
        for (key, value) in server {
            if key != "id" {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    decode_data(collection, &merged)
}
