use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use hashbrown::HashMap;
use serde::Deserialize;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tracing::{debug, error, trace};

use crate::types::now_ms;

use super::message::{component_channel, BusMessage, MessageKind};

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

/// Drain cadence and batch bound.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Interval between background drain cycles.
    pub tick_ms: u64,
    /// Messages delivered per drain cycle.
    pub batch_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            batch_size: 10,
        }
    }
}

/// In-process priority publish/subscribe dispatcher.
///
/// Cloning yields another handle to the same bus. Nothing is delivered until a
/// drain cycle runs, either from the background tick started with
/// [`MessageBus::start`] or explicitly through [`MessageBus::drain_once`] /
/// [`MessageBus::flush`].
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    queue: Mutex<Vec<BusMessage>>,
    subscribers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_seq: AtomicU64,
    next_subscriber: AtomicU64,
    ticker: Mutex<Option<Ticker>>,
}

struct Ticker {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Capability to deregister a subscriber.
#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe to remove it"]
pub struct Subscription {
    bus: Weak<BusInner>,
    channel: String,
    id: u64,
}

impl Subscription {
    /// Channel the handler is registered on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Removes the handler. Returns false if the bus is gone or the handler was already removed.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut subscribers = lock(&inner.subscribers);
        let Some(handlers) = subscribers.get_mut(&self.channel) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != self.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            subscribers.remove(&self.channel);
        }
        removed
    }
}

impl MessageBus {
    /// Stopped bus with no subscribers.
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                queue: Mutex::new(Vec::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                next_subscriber: AtomicU64::new(1),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Enqueues `message` and returns immediately. Stamps the publish time.
    pub fn publish(&self, mut message: BusMessage) {
        message.timestamp_ms = now_ms();
        message.seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        trace!(kind = %message.kind, seq = message.seq, "bus publish");
        lock(&self.inner.queue).push(message);
    }

    /// Registers `handler` for every message of `kind`.
    pub fn subscribe(
        &self,
        kind: MessageKind,
        handler: impl Fn(&BusMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_channel(kind.as_str().to_string(), Arc::new(handler))
    }

    /// Registers `handler` for messages of `kind` targeted at `component`.
    pub fn subscribe_component(
        &self,
        component: &str,
        kind: MessageKind,
        handler: impl Fn(&BusMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_channel(component_channel(component, kind), Arc::new(handler))
    }

    fn subscribe_channel(&self, channel: String, handler: Handler) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers)
            .entry(channel.clone())
            .or_default()
            .push((id, handler));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            channel,
            id,
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn subscriber_count(&self, kind: MessageKind) -> usize {
        lock(&self.inner.subscribers)
            .get(kind.as_str())
            .map_or(0, Vec::len)
    }

    /// Messages waiting for a drain cycle.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Runs one dispatch cycle: sorts the queue by priority then publish time
    /// and delivers at most `batch_size` messages. Returns how many were delivered.
    pub fn drain_once(&self) -> usize {
        let batch: Vec<BusMessage> = {
            let mut queue = lock(&self.inner.queue);
            queue.sort_by_key(|m| (m.priority.rank(), m.timestamp_ms, m.seq));
            let take = queue.len().min(self.inner.config.batch_size.max(1));
            queue.drain(..take).collect()
        };

        for message in &batch {
            self.deliver(message);
        }
        batch.len()
    }

    /// Drains until the queue is empty, including messages published by handlers.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        loop {
            let n = self.drain_once();
            if n == 0 {
                return delivered;
            }
            delivered += n;
        }
    }

    fn deliver(&self, message: &BusMessage) {
        let mut channels = vec![message.kind.as_str().to_string()];
        if let Some(channel) = message.target_channel() {
            channels.push(channel);
        }

        for channel in channels {
            // Handlers run outside the lock so they may publish or subscribe.
            let handlers: Vec<Handler> = lock(&self.inner.subscribers)
                .get(&channel)
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();

            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                    error!(channel = %channel, seq = message.seq, "bus subscriber panicked");
                }
            }
        }
    }

    /// Starts the periodic drain tick. Returns false if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut ticker = lock(&self.inner.ticker);
        if ticker.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let bus = self.clone();
        let period = Duration::from_millis(self.inner.config.tick_ms.max(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        bus.drain_once();
                    }
                }
            }
        });

        *ticker = Some(Ticker { stop_tx, task });
        debug!(tick_ms = self.inner.config.tick_ms, "message bus started");
        true
    }

    /// Stops the drain tick and waits for it to exit. Queued messages stay queued.
    pub async fn stop(&self) -> bool {
        let ticker = lock(&self.inner.ticker).take();
        let Some(ticker) = ticker else {
            return false;
        };
        let _ = ticker.stop_tx.send(());
        let _ = ticker.task.await;
        debug!("message bus stopped");
        true
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.ticker).is_some()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
