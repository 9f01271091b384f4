//! SQLite-backed durable local store.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{
    entity::Entity,
    op::SyncQueueItem,
    types::{Collection, LocalId},
};

use super::{LocalStore, StoreError, StoreResult};

const ENTITY_FORMAT_VERSION: u16 = 1;
const QUEUE_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EntityEnvelope {
    format_version: u16,
    entity: Entity,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueEnvelope {
    format_version: u16,
    item: SyncQueueItem,
}

/// SQLite implementation of [`crate::persist::LocalStore`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens or creates a SQLite-backed store at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Number of rows in `collection`.
    pub fn count(&self, collection: Collection) -> StoreResult<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE collection = ?1",
            params![collection.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, collection: Collection, id: LocalId) -> StoreResult<Option<Entity>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM entities WHERE collection = ?1 AND local_id = ?2",
                params![collection.as_str(), id.0 as i64],
                |row| row.get(0),
            )
            .optional()?;

        payload.map(|bytes| decode_entity(&bytes)).transpose()
    }

    fn get_all(&self, collection: Collection) -> StoreResult<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload FROM entities WHERE collection = ?1 ORDER BY local_id ASC",
        )?;
        let rows = stmt.query_map(params![collection.as_str()], |row| row.get::<_, Vec<u8>>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode_entity(&row?)?);
        }
        Ok(out)
    }

    fn put(&mut self, entity: Entity) -> StoreResult<Entity> {
        let env = EntityEnvelope {
            format_version: ENTITY_FORMAT_VERSION,
            entity,
        };
        let payload = serde_json::to_vec(&env)?;
        let entity = env.entity;
        self.conn.execute(
            "INSERT INTO entities(collection, local_id, remote_id, updated_at_ms, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(collection, local_id) DO UPDATE SET
                remote_id = excluded.remote_id,
                updated_at_ms = excluded.updated_at_ms,
                payload = excluded.payload",
            params![
                entity.collection().as_str(),
                entity.key.local.0 as i64,
                entity.key.remote.as_ref().map(|r| r.as_str()),
                entity.updated_at_ms as i64,
                payload,
            ],
        )?;
        Ok(entity)
    }

    fn delete(&mut self, collection: Collection, id: LocalId) -> StoreResult<()> {
        self.conn.execute(
            "DELETE FROM entities WHERE collection = ?1 AND local_id = ?2",
            params![collection.as_str(), id.0 as i64],
        )?;
        Ok(())
    }

    fn put_queue_item(&mut self, item: &SyncQueueItem) -> StoreResult<()> {
        let env = QueueEnvelope {
            format_version: QUEUE_FORMAT_VERSION,
            item: item.clone(),
        };
        let payload = serde_json::to_vec(&env)?;
        self.conn.execute(
            "INSERT INTO sync_queue(item_id, collection, local_id, payload)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id) DO UPDATE SET payload = excluded.payload",
            params![
                item.id as i64,
                item.collection.as_str(),
                item.target.0 as i64,
                payload,
            ],
        )?;
        Ok(())
    }

    fn delete_queue_item(&mut self, id: u64) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM sync_queue WHERE item_id = ?1", params![id as i64])?;
        Ok(())
    }

    fn load_queue(&self) -> StoreResult<Vec<SyncQueueItem>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM sync_queue ORDER BY item_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut out = Vec::new();
        for row in rows {
            let env: QueueEnvelope = serde_json::from_slice(&row?)?;
            if env.format_version != QUEUE_FORMAT_VERSION {
                return Err(StoreError::Message(format!(
                    "unsupported queue format version: {}",
                    env.format_version
                )));
            }
            out.push(env.item);
        }
        Ok(out)
    }
}

fn decode_entity(payload: &[u8]) -> StoreResult<Entity> {
    let env: EntityEnvelope = serde_json::from_slice(payload)?;
    if env.format_version != ENTITY_FORMAT_VERSION {
        return Err(StoreError::Message(format!(
            "unsupported entity format version: {}",
            env.format_version
        )));
    }
    Ok(env.entity)
}
