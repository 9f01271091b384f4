//! Bus message payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kind; also the name of the general delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// A record was created locally.
    DbInsert,
    /// A record was changed locally.
    DbUpdate,
    /// A record was removed locally.
    DbDelete,
    /// Local records were merged with a remote fetch.
    DbSync,
    /// Network became reachable.
    NetworkOnline,
    /// Network became unreachable.
    NetworkOffline,
    /// A queued operation was confirmed by the server.
    SyncComplete,
    /// Synchronization keeps failing.
    SyncFailed,
    /// UI must re-render.
    UiRefresh,
    /// UI filter changed.
    UiFilterChange,
    /// UI tab changed.
    UiTabChange,
}

impl MessageKind {
    /// Channel name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DbInsert => "DB_INSERT",
            Self::DbUpdate => "DB_UPDATE",
            Self::DbDelete => "DB_DELETE",
            Self::DbSync => "DB_SYNC",
            Self::NetworkOnline => "NETWORK_ONLINE",
            Self::NetworkOffline => "NETWORK_OFFLINE",
            Self::SyncComplete => "SYNC_COMPLETE",
            Self::SyncFailed => "SYNC_FAILED",
            Self::UiRefresh => "UI_REFRESH",
            Self::UiFilterChange => "UI_FILTER_CHANGE",
            Self::UiTabChange => "UI_TAB_CHANGE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched first.
    High,
    /// Default.
    #[default]
    Medium,
    /// Dispatched last.
    Low,
}

impl Priority {
    /// Sort rank; lower dispatches earlier.
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

/// Where a message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceCategory {
    /// Local store writes.
    LocalStore,
    /// Remote gateway outcomes.
    Network,
    /// Direct user actions.
    UserInput,
    /// Anything else.
    #[default]
    System,
}

/// Message delivered to bus subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Kind and general channel.
    pub kind: MessageKind,
    /// Free-form payload.
    pub payload: Value,
    /// Delivery priority.
    pub priority: Priority,
    /// Origin.
    pub source: SourceCategory,
    /// Assigned by [`crate::bus::MessageBus::publish`].
    pub timestamp_ms: u64,
    /// Component that additionally receives the message on `component:KIND`.
    pub target: Option<String>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl BusMessage {
    /// Medium priority, system source, no target.
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            priority: Priority::Medium,
            source: SourceCategory::System,
            timestamp_ms: 0,
            target: None,
            seq: 0,
        }
    }

    /// Sets the delivery priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the origin category.
    pub fn with_source(mut self, source: SourceCategory) -> Self {
        self.source = source;
        self
    }

    /// Addresses the message to one component.
    pub fn with_target(mut self, component: impl Into<String>) -> Self {
        self.target = Some(component.into());
        self
    }

    /// Component-qualified channel name, when targeted.
    pub fn target_channel(&self) -> Option<String> {
        self.target
            .as_ref()
            .map(|component| component_channel(component, self.kind))
    }
}

/// Channel name for targeted delivery.
pub fn component_channel(component: &str, kind: MessageKind) -> String {
    format!("{component}:{}", kind.as_str())
}
