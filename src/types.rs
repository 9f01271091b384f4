//! Shared identifiers, collections, and booking-related enums.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier assigned on local creation, before any server confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u64);

/// Identifier assigned by the remote authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub String);

impl RemoteId {
    /// Creates a remote id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw server identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Reference to an entity under either identifier regime.
///
/// Serialized untagged: local ids as JSON numbers, remote ids as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Not yet confirmed by the server.
    Local(LocalId),
    /// Server-assigned.
    Remote(RemoteId),
}

impl EntityId {
    /// Shorthand for a remote reference.
    pub fn remote(value: impl Into<String>) -> Self {
        Self::Remote(RemoteId::new(value))
    }

    /// Returns the local id when this is a local reference.
    pub fn as_local(&self) -> Option<LocalId> {
        match self {
            Self::Local(id) => Some(*id),
            Self::Remote(_) => None,
        }
    }
}

impl From<LocalId> for EntityId {
    fn from(value: LocalId) -> Self {
        Self::Local(value)
    }
}

impl From<RemoteId> for EntityId {
    fn from(value: RemoteId) -> Self {
        Self::Remote(value)
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => id.fmt(f),
            Self::Remote(id) => id.fmt(f),
        }
    }
}

/// Both identifiers of a stored entity. The local id never changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Store key.
    pub local: LocalId,
    /// Present once the server has confirmed the entity.
    pub remote: Option<RemoteId>,
}

impl EntityKey {
    /// Key for an entity that exists only locally.
    pub fn local(local: LocalId) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    /// Preferred public identifier: remote when known, local otherwise.
    pub fn id(&self) -> EntityId {
        match &self.remote {
            Some(remote) => EntityId::Remote(remote.clone()),
            None => EntityId::Local(self.local),
        }
    }
}

/// Synchronized collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Bookable occasions.
    Events,
    /// Per-user registrations.
    Bookings,
    /// Member profiles.
    Users,
}

impl Collection {
    /// Every collection, in dispatch order.
    pub const ALL: [Collection; 3] = [Collection::Users, Collection::Events, Collection::Bookings];

    /// Name used in store tables and request paths.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Bookings => "bookings",
            Self::Users => "users",
        }
    }

    /// Parses a collection name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "events" => Some(Self::Events),
            "bookings" => Some(Self::Bookings),
            "users" => Some(Self::Users),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-time viewer classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    /// Anonymous visitor.
    #[default]
    Visitor,
    /// Signed-up member.
    Registered,
    /// Paying member.
    Vip,
    /// Top tier.
    Vvip,
}

/// Attendee gender, used for pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    /// Male price applies.
    #[default]
    Male,
    /// Female price applies.
    Female,
}

/// Marital status, used by eligibility filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaritalStatus {
    /// Never married.
    #[default]
    Single,
    /// Married.
    Married,
    /// Divorced.
    Divorced,
    /// Widowed.
    Widowed,
}

/// Kind of trip an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripType {
    /// Same-day outing.
    #[default]
    DayTrip,
    /// One night away.
    Overnight,
    /// Multi-day weekend trip.
    Weekend,
    /// Travel abroad.
    Abroad,
    /// Anything else.
    Other,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
