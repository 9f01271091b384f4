#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use bookingsync::{
    bus::MessageBus,
    core::status::EventStatus,
    entity::{EventData, UserData},
    persist::memory::MemoryStore,
    remote::{Method, RemoteError, RemoteGateway, RemoteResponse},
    sync::{spawn_sync_engine, Engine, SyncConfig, SyncHandle},
    types::{Gender, MembershipTier},
};

/// In-process stand-in for the remote authority.
///
/// Keeps records per collection and numbers each collection separately on
/// POST (`1`, `2`, ...), the way a table-per-collection server does. It can be
/// switched off or told to fail the next few calls.
pub struct FakeServer {
    online: AtomicBool,
    fail_remaining: AtomicUsize,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    records: HashMap<String, BTreeMap<String, Value>>,
    next_ids: HashMap<String, u64>,
    log: Vec<(Method, String)>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            fail_remaining: AtomicUsize::new(0),
            state: Mutex::new(ServerState::default()),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Places a record directly, as if another client created it.
    pub fn seed(&self, collection: &str, id: &str, mut record: Value) {
        if let Value::Object(map) = &mut record {
            map.insert("id".to_string(), json!(id));
        }
        self.state
            .lock()
            .expect("lock")
            .records
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
    }

    pub fn remove(&self, collection: &str, id: &str) {
        if let Some(records) = self.state.lock().expect("lock").records.get_mut(collection) {
            records.remove(id);
        }
    }

    pub fn record(&self, collection: &str, id: &str) -> Option<Value> {
        self.state
            .lock()
            .expect("lock")
            .records
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned()
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.state
            .lock()
            .expect("lock")
            .records
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Requests that reached the server, in arrival order.
    pub fn log(&self) -> Vec<(Method, String)> {
        self.state.lock().expect("lock").log.clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.log().iter().filter(|(m, _)| *m == method).count()
    }
}

#[async_trait]
impl RemoteGateway for FakeServer {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        _auth_token: Option<&str>,
    ) -> Result<RemoteResponse, RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("connection refused".to_string()));
        }
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Ok(RemoteResponse::new(503, Value::Null));
        }

        let mut parts = path.trim_start_matches('/').splitn(2, '/');
        let collection = parts.next().unwrap_or_default().to_string();
        let id = parts.next().map(str::to_string);

        let mut guard = self.state.lock().expect("lock");
        let state = &mut *guard;
        state.log.push((method, path.to_string()));
        let records = state.records.entry(collection.clone()).or_default();

        match (method, id) {
            (Method::Get, None) => Ok(RemoteResponse::new(
                200,
                Value::Array(records.values().cloned().collect()),
            )),
            (Method::Post, None) => {
                let next_id = state.next_ids.entry(collection).or_insert(0);
                *next_id += 1;
                let assigned = *next_id;
                let mut record = body.cloned().unwrap_or_else(|| json!({}));
                if let Value::Object(map) = &mut record {
                    map.insert("id".to_string(), json!(assigned));
                }
                records.insert(assigned.to_string(), record.clone());
                Ok(RemoteResponse::new(201, record))
            }
            (Method::Put, Some(id)) => {
                let Some(record) = records.get_mut(&id) else {
                    return Ok(RemoteResponse::new(404, Value::Null));
                };
                if let (Value::Object(target), Some(Value::Object(patch))) = (record, body) {
                    for (key, value) in patch {
                        target.insert(key.clone(), value.clone());
                    }
                }
                Ok(RemoteResponse::new(200, records[&id].clone()))
            }
            (Method::Delete, Some(id)) => {
                records.remove(&id);
                Ok(RemoteResponse::new(204, Value::Null))
            }
            _ => Ok(RemoteResponse::new(405, Value::Null)),
        }
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry_interval_ms: 20,
        backoff_base_ms: 10,
        backoff_max_ms: 40,
        request_timeout_ms: 500,
        ..SyncConfig::default()
    }
}

pub fn engine() -> Engine {
    Engine::open(Box::new(MemoryStore::new()), MessageBus::default(), test_config()).expect("open engine")
}

pub fn spawn(server: &Arc<FakeServer>, config: SyncConfig) -> SyncHandle {
    let engine =
        Engine::open(Box::new(MemoryStore::new()), MessageBus::default(), config).expect("open engine");
    spawn_sync_engine(engine, server.clone())
}

pub fn event(name: &str, max: Option<u32>) -> EventData {
    EventData {
        name: name.to_string(),
        max_participants: max,
        status: EventStatus::Published,
        ..EventData::default()
    }
}

pub fn user(name: &str) -> UserData {
    UserData {
        display_name: name.to_string(),
        email: format!("{}@example.org", name.to_lowercase()),
        gender: Gender::Female,
        age: Some(30),
        membership: MembershipTier::Registered,
        ..UserData::default()
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
