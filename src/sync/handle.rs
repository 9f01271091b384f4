use std::sync::Arc;

use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    booking::rules::BookingDetails,
    bus::MessageBus,
    core::status::EventStatus,
    entity::{Entity, EntityData, EntityPatch},
    remote::{self, wire::{collection_path, decode_list}, Method, RemoteError, RemoteGateway, RemoteRequest},
    types::{now_ms, Collection, EntityId},
};

use super::{
    booking::{BookingOutcome, CancelOutcome},
    engine::{Engine, SyncError},
    reconcile::{Dispatch, RefreshReport, SyncPass},
};

type EntityFilter = Box<dyn Fn(&Entity) -> bool + Send>;

/// Cloneable front end of a running sync engine.
///
/// Local operations resolve as soon as the local write is done; remote
/// confirmation happens in the background.
#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Command>,
    bus: MessageBus,
}

enum Command {
    Create {
        data: EntityData,
        resp: oneshot::Sender<Result<Entity, SyncError>>,
    },
    Update {
        id: EntityId,
        patch: EntityPatch,
        resp: oneshot::Sender<Result<Entity, SyncError>>,
    },
    Delete {
        collection: Collection,
        id: EntityId,
        resp: oneshot::Sender<Result<bool, SyncError>>,
    },
    Get {
        collection: Collection,
        id: EntityId,
        resp: oneshot::Sender<Result<Option<Entity>, SyncError>>,
    },
    GetAll {
        collection: Collection,
        filter: EntityFilter,
        resp: oneshot::Sender<Result<Vec<Entity>, SyncError>>,
    },
    Transition {
        event_id: EntityId,
        to: EventStatus,
        resp: oneshot::Sender<Result<Entity, SyncError>>,
    },
    Book {
        event_id: EntityId,
        user_id: EntityId,
        details: BookingDetails,
        resp: oneshot::Sender<Result<BookingOutcome, SyncError>>,
    },
    Cancel {
        event_id: EntityId,
        user_id: EntityId,
        resp: oneshot::Sender<Result<CancelOutcome, SyncError>>,
    },
    Refresh {
        collection: Collection,
        resp: oneshot::Sender<Result<RefreshReport, SyncError>>,
    },
    Discard {
        collection: Collection,
        id: EntityId,
        resp: oneshot::Sender<Result<usize, SyncError>>,
    },
    SetOnline {
        online: bool,
        resp: oneshot::Sender<bool>,
    },
    SetAuthToken {
        token: Option<String>,
        resp: oneshot::Sender<()>,
    },
    SyncNow {
        resp: oneshot::Sender<usize>,
    },
    Pending {
        resp: oneshot::Sender<usize>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

enum RemoteOutcome {
    Pushed {
        item_id: u64,
        collection: Collection,
        result: Result<Value, RemoteError>,
    },
    Fetched {
        collection: Collection,
        started_ms: u64,
        result: Result<Value, RemoteError>,
        resp: oneshot::Sender<Result<RefreshReport, SyncError>>,
    },
}

/// A forced pass and the callers waiting for it.
struct ActivePass {
    state: SyncPass,
    waiters: Vec<oneshot::Sender<usize>>,
}

/// Moves `engine` onto a tokio task and returns its handle.
///
/// The task owns all engine state. Remote calls run on separate tasks and
/// report back over a channel, so a slow server never delays local commands.
pub fn spawn_sync_engine(engine: Engine, gateway: Arc<dyn RemoteGateway>) -> SyncHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(engine.config().command_queue_bound.max(1));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<RemoteOutcome>();
    let bus = engine.bus().clone();

    tokio::spawn(async move {
        let mut engine = engine;
        let mut pass: Option<ActivePass> = None;
        let mut sweep = interval(Duration::from_millis(engine.config().retry_interval_ms.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(online = engine.is_online(), "sync engine started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if handle_command(cmd, &mut engine, &gateway, &outcome_tx, &mut pass) {
                        break;
                    }
                }
                Some(outcome) = outcome_rx.recv() => {
                    handle_outcome(outcome, &mut engine, &mut pass);
                }
                _ = sweep.tick() => {}
            }
            dispatch(&mut engine, &gateway, &outcome_tx, &mut pass);
        }

        if let Some(pass) = pass.take() {
            let pending = engine.pending_count();
            for waiter in pass.waiters {
                let _ = waiter.send(pending);
            }
        }
        info!(pending = engine.pending_count(), "sync engine stopped");
    });

    SyncHandle { cmd_tx, bus }
}

fn handle_command(
    cmd: Command,
    engine: &mut Engine,
    gateway: &Arc<dyn RemoteGateway>,
    outcome_tx: &mpsc::UnboundedSender<RemoteOutcome>,
    pass: &mut Option<ActivePass>,
) -> bool {
    match cmd {
        Command::Create { data, resp } => {
            let _ = resp.send(engine.create(data));
        }
        Command::Update { id, patch, resp } => {
            let _ = resp.send(engine.update(&id, patch));
        }
        Command::Delete { collection, id, resp } => {
            let _ = resp.send(engine.delete(collection, &id));
        }
        Command::Get { collection, id, resp } => {
            let _ = resp.send(engine.get_by_id(collection, &id));
        }
        Command::GetAll { collection, filter, resp } => {
            let _ = resp.send(engine.get_all(collection, filter));
        }
        Command::Transition { event_id, to, resp } => {
            let _ = resp.send(engine.transition_status(&event_id, to));
        }
        Command::Book {
            event_id,
            user_id,
            details,
            resp,
        } => {
            let _ = resp.send(engine.book_event(&event_id, &user_id, details));
        }
        Command::Cancel { event_id, user_id, resp } => {
            let _ = resp.send(engine.cancel_booking(&event_id, &user_id));
        }
        Command::Refresh { collection, resp } => {
            if !engine.is_online() {
                let report = engine.refresh_failed(collection, &RemoteError::Unavailable("offline".to_string()));
                let _ = resp.send(Ok(report));
                return false;
            }
            let request = RemoteRequest {
                method: Method::Get,
                path: collection_path(collection),
                body: None,
            };
            let started_ms = now_ms();
            let gateway = Arc::clone(gateway);
            let tx = outcome_tx.clone();
            let token = engine.config().auth_token.clone();
            let timeout_ms = engine.config().request_timeout_ms;
            tokio::spawn(async move {
                let result = remote::send(gateway.as_ref(), &request, token.as_deref(), timeout_ms).await;
                let _ = tx.send(RemoteOutcome::Fetched {
                    collection,
                    started_ms,
                    result,
                    resp,
                });
            });
        }
        Command::Discard { collection, id, resp } => {
            let _ = resp.send(engine.discard_pending(collection, &id));
        }
        Command::SetOnline { online, resp } => {
            let _ = resp.send(engine.set_online(online));
        }
        Command::SetAuthToken { token, resp } => {
            engine.set_auth_token(token);
            let _ = resp.send(());
        }
        Command::SyncNow { resp } => {
            if !engine.is_online() {
                let _ = resp.send(engine.pending_count());
                return false;
            }
            match pass {
                Some(active) => active.waiters.push(resp),
                None => {
                    debug!(pending = engine.pending_count(), "forced sync pass started");
                    *pass = Some(ActivePass {
                        state: SyncPass::default(),
                        waiters: vec![resp],
                    });
                }
            }
        }
        Command::Pending { resp } => {
            let _ = resp.send(engine.pending_count());
        }
        Command::Shutdown { resp } => {
            let _ = resp.send(());
            return true;
        }
    }
    false
}

fn handle_outcome(outcome: RemoteOutcome, engine: &mut Engine, pass: &mut Option<ActivePass>) {
    match outcome {
        RemoteOutcome::Pushed {
            item_id,
            collection,
            result,
        } => {
            let ok = engine.on_sync_result(item_id, collection, result);
            if !ok {
                if let Some(active) = pass.as_mut() {
                    active.state.failed.insert(collection);
                }
            }
        }
        RemoteOutcome::Fetched {
            collection,
            started_ms,
            result,
            resp,
        } => {
            let report = match result.and_then(decode_list) {
                Ok(records) => engine.merge_remote(collection, records, started_ms),
                Err(err) => Ok(engine.refresh_failed(collection, &err)),
            };
            let _ = resp.send(report);
        }
    }
}

/// Sends whatever is due, then settles a finished forced pass.
fn dispatch(
    engine: &mut Engine,
    gateway: &Arc<dyn RemoteGateway>,
    outcome_tx: &mpsc::UnboundedSender<RemoteOutcome>,
    pass: &mut Option<ActivePass>,
) {
    let dispatches = engine.next_dispatches(now_ms(), pass.as_ref().map(|p| &p.state));
    for Dispatch {
        item_id,
        collection,
        request,
    } in dispatches
    {
        debug!(item_id, %collection, method = %request.method, path = %request.path, "sending sync item");
        let gateway = Arc::clone(gateway);
        let tx = outcome_tx.clone();
        let token = engine.config().auth_token.clone();
        let timeout_ms = engine.config().request_timeout_ms;
        tokio::spawn(async move {
            let result = remote::send(gateway.as_ref(), &request, token.as_deref(), timeout_ms).await;
            let _ = tx.send(RemoteOutcome::Pushed {
                item_id,
                collection,
                result,
            });
        });
    }

    if pass.is_some() && engine.queue().in_flight_count() == 0 {
        if let Some(done) = pass.take() {
            let pending = engine.pending_count();
            debug!(pending, failed = done.state.failed.len(), "forced sync pass finished");
            for waiter in done.waiters {
                let _ = waiter.send(pending);
            }
        }
    }
}

impl SyncHandle {
    /// Bus the engine publishes to.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub async fn create(&self, data: EntityData) -> Result<Entity, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Create { data, resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn update(&self, id: impl Into<EntityId>, patch: EntityPatch) -> Result<Entity, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Update {
                id: id.into(),
                patch,
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Returns false when the record did not exist.
    pub async fn delete(&self, collection: Collection, id: impl Into<EntityId>) -> Result<bool, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Delete {
                collection,
                id: id.into(),
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn get_by_id(
        &self,
        collection: Collection,
        id: impl Into<EntityId>,
    ) -> Result<Option<Entity>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get {
                collection,
                id: id.into(),
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn get_all(
        &self,
        collection: Collection,
        filter: impl Fn(&Entity) -> bool + Send + 'static,
    ) -> Result<Vec<Entity>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetAll {
                collection,
                filter: Box::new(filter),
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn transition_status(
        &self,
        event_id: impl Into<EntityId>,
        to: EventStatus,
    ) -> Result<Entity, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Transition {
                event_id: event_id.into(),
                to,
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn book_event(
        &self,
        event_id: impl Into<EntityId>,
        user_id: impl Into<EntityId>,
        details: BookingDetails,
    ) -> Result<BookingOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Book {
                event_id: event_id.into(),
                user_id: user_id.into(),
                details,
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    pub async fn cancel_booking(
        &self,
        event_id: impl Into<EntityId>,
        user_id: impl Into<EntityId>,
    ) -> Result<CancelOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Cancel {
                event_id: event_id.into(),
                user_id: user_id.into(),
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Fetches the collection and merges it locally. A failed fetch is not an
    /// error: the report says `remote_available: false`.
    pub async fn refresh_from_remote(&self, collection: Collection) -> Result<RefreshReport, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Refresh { collection, resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Drops queued operations for a record. Returns how many were dropped.
    pub async fn discard_pending(
        &self,
        collection: Collection,
        id: impl Into<EntityId>,
    ) -> Result<usize, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Discard {
                collection,
                id: id.into(),
                resp: tx,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Returns true when the state changed.
    pub async fn set_online(&self, online: bool) -> Result<bool, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetOnline { online, resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn set_auth_token(&self, token: Option<String>) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SetAuthToken { token, resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Attempts every queued item once, ignoring backoff, and returns the
    /// number still pending afterwards.
    pub async fn sync_now(&self) -> Result<usize, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SyncNow { resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn pending_count(&self) -> Result<usize, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Pending { resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }
}
