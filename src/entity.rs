//! Synchronized records, their collection-specific data, and sparse patches.

use serde::{Deserialize, Serialize};

use crate::{
    core::status::EventStatus,
    types::{
        Collection, EntityId, EntityKey, Gender, MaritalStatus, MembershipTier, TripType,
    },
};

/// Per-gender price and voucher discount table, in cents.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    /// Price for male attendees.
    pub male_price_cents: u64,
    /// Price for female attendees.
    pub female_price_cents: u64,
    /// Accepted voucher codes.
    pub vouchers: Vec<Voucher>,
}

/// Voucher code and the flat discount it grants.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Voucher {
    /// Code entered by the attendee.
    pub code: String,
    /// Discount in cents.
    pub discount_cents: u64,
}

/// Who may book an event. Empty marital filter accepts everyone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Eligibility {
    /// Inclusive minimum age.
    pub min_age: Option<u8>,
    /// Inclusive maximum age.
    pub max_age: Option<u8>,
    /// Accepted marital statuses.
    pub marital_statuses: Vec<MaritalStatus>,
}

/// Whether the event is listed for each membership tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierVisibility {
    /// Listed to visitors.
    pub visitor: bool,
    /// Listed to registered members.
    pub registered: bool,
    /// Listed to VIP members.
    pub vip: bool,
    /// Listed to VVIP members.
    pub vvip: bool,
}

impl Default for TierVisibility {
    fn default() -> Self {
        Self {
            visitor: true,
            registered: true,
            vip: true,
            vvip: true,
        }
    }
}

impl TierVisibility {
    /// Returns the flag for `tier`.
    pub fn allows(&self, tier: MembershipTier) -> bool {
        match tier {
            MembershipTier::Visitor => self.visitor,
            MembershipTier::Registered => self.registered,
            MembershipTier::Vip => self.vip,
            MembershipTier::Vvip => self.vvip,
        }
    }
}

/// Participant status on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    /// Booked, awaiting confirmation.
    #[default]
    Pending,
    /// Confirmed seat.
    Confirmed,
    /// Seat given up.
    Cancelled,
    /// Waiting for a seat.
    Waitlist,
}

/// Voucher applied when a participant joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoucherUsage {
    /// Voucher code.
    pub code: String,
    /// Discount granted, in cents.
    pub discount_cents: u64,
}

/// One seat on an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Booked user.
    pub user_id: EntityId,
    /// Seat status.
    #[serde(default)]
    pub status: ParticipantStatus,
    /// Payment received.
    #[serde(default)]
    pub paid: bool,
    /// Voucher used, if any.
    #[serde(default)]
    pub voucher: Option<VoucherUsage>,
    /// Join timestamp in milliseconds.
    #[serde(default)]
    pub joined_at_ms: u64,
}

impl Participant {
    /// True unless the seat was given up.
    pub fn is_active(&self) -> bool {
        self.status != ParticipantStatus::Cancelled
    }
}

/// Bookable occasion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventData {
    /// Display name.
    pub name: String,
    /// Scheduled start in milliseconds.
    pub starts_at_ms: u64,
    /// Venue or meeting point.
    pub location: String,
    /// Free-form category.
    pub category: String,
    /// Kind of trip.
    pub trip_type: TripType,
    /// Prices and vouchers.
    pub pricing: Pricing,
    /// Booking requirements.
    pub eligibility: Eligibility,
    /// Seat limit; `None` means unlimited.
    pub max_participants: Option<u32>,
    /// Lifecycle state.
    pub status: EventStatus,
    /// Seats taken.
    pub participants: Vec<Participant>,
    /// Per-tier listing flags.
    pub visibility: TierVisibility,
}

impl EventData {
    /// Number of participants holding a seat.
    pub fn active_participants(&self) -> usize {
        self.participants.iter().filter(|p| p.is_active()).count()
    }

    /// True when no more seats are available.
    pub fn is_at_capacity(&self) -> bool {
        self.max_participants
            .is_some_and(|max| self.active_participants() >= max as usize)
    }
}

/// Booking lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    /// Created by a booking request.
    #[default]
    Pending,
    /// Confirmed by user or admin.
    Confirmed,
    /// Cancelled.
    Cancelled,
}

/// User-facing registration, kept in lockstep with an event participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingData {
    /// Booked event.
    pub event_id: EntityId,
    /// Booking owner.
    pub user_id: EntityId,
    /// Lifecycle state.
    #[serde(default)]
    pub status: BookingStatus,
    /// Amount due in cents.
    #[serde(default)]
    pub amount_cents: u64,
    /// Voucher code used.
    #[serde(default)]
    pub voucher_code: Option<String>,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
    /// Creation timestamp in milliseconds.
    #[serde(default)]
    pub booked_at_ms: u64,
}

/// Member profile.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserData {
    /// Display name.
    pub display_name: String,
    /// Contact email.
    pub email: String,
    /// Gender.
    pub gender: Gender,
    /// Age in years, when known.
    pub age: Option<u8>,
    /// Marital status.
    pub marital_status: MaritalStatus,
    /// Membership tier.
    pub membership: MembershipTier,
}

/// Collection-specific payload of an [`Entity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "data", rename_all = "lowercase")]
pub enum EntityData {
    /// Event record.
    Event(EventData),
    /// Booking record.
    Booking(BookingData),
    /// User record.
    User(UserData),
}

impl EntityData {
    /// Collection the payload belongs to.
    pub fn collection(&self) -> Collection {
        match self {
            Self::Event(_) => Collection::Events,
            Self::Booking(_) => Collection::Bookings,
            Self::User(_) => Collection::Users,
        }
    }

    /// Visits every cross-entity reference.
    pub fn map_refs(&mut self, mut f: impl FnMut(&mut EntityId)) {
        match self {
            Self::Event(event) => {
                for participant in &mut event.participants {
                    f(&mut participant.user_id);
                }
            }
            Self::Booking(booking) => {
                f(&mut booking.event_id);
                f(&mut booking.user_id);
            }
            Self::User(_) => {}
        }
    }
}

/// Stored record: identifiers, timestamps, and data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Local and remote identifiers.
    pub key: EntityKey,
    /// Local creation time in milliseconds.
    pub created_at_ms: u64,
    /// Last local modification in milliseconds.
    pub updated_at_ms: u64,
    /// Record content.
    pub data: EntityData,
}

impl Entity {
    /// Collection of the record.
    pub fn collection(&self) -> Collection {
        self.data.collection()
    }

    /// Preferred public identifier.
    pub fn id(&self) -> EntityId {
        self.key.id()
    }

    /// Event data, when this is an event.
    pub fn as_event(&self) -> Option<&EventData> {
        match &self.data {
            EntityData::Event(event) => Some(event),
            _ => None,
        }
    }

    /// Booking data, when this is a booking.
    pub fn as_booking(&self) -> Option<&BookingData> {
        match &self.data {
            EntityData::Booking(booking) => Some(booking),
            _ => None,
        }
    }

    /// User data, when this is a user.
    pub fn as_user(&self) -> Option<&UserData> {
        match &self.data {
            EntityData::User(user) => Some(user),
            _ => None,
        }
    }
}

/// Sparse event patch where each `Some` field overwrites the record value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventPatch {
    /// New event name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New start time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at_ms: Option<u64>,
    /// New location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// New category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// New trip type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_type: Option<TripType>,
    /// Replacement pricing table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
    /// Replacement eligibility rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eligibility: Option<Eligibility>,
    /// `Some(None)` clears the limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<Option<u32>>,
    /// Lifecycle transition target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    /// Full replacement participant list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Participant>>,
    /// Replacement tier visibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<TierVisibility>,
}

impl EventPatch {
    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies this patch in place to `rec`.
    pub fn apply_to(&self, rec: &mut EventData) {
        if let Some(v) = &self.name {
            rec.name = v.clone();
        }
        if let Some(v) = self.starts_at_ms {
            rec.starts_at_ms = v;
        }
        if let Some(v) = &self.location {
            rec.location = v.clone();
        }
        if let Some(v) = &self.category {
            rec.category = v.clone();
        }
        if let Some(v) = self.trip_type {
            rec.trip_type = v;
        }
        if let Some(v) = &self.pricing {
            rec.pricing = v.clone();
        }
        if let Some(v) = &self.eligibility {
            rec.eligibility = v.clone();
        }
        if let Some(v) = self.max_participants {
            rec.max_participants = v;
        }
        if let Some(v) = self.status {
            rec.status = v;
        }
        if let Some(v) = &self.participants {
            rec.participants = v.clone();
        }
        if let Some(v) = self.visibility {
            rec.visibility = v;
        }
    }
}

/// Sparse booking patch. Event and owner are fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingPatch {
    /// New booking status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BookingStatus>,
    /// New amount due.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_cents: Option<u64>,
    /// `Some(None)` removes the voucher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher_code: Option<Option<String>>,
    /// New notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl BookingPatch {
    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies this patch in place to `rec`.
    pub fn apply_to(&self, rec: &mut BookingData) {
        if let Some(v) = self.status {
            rec.status = v;
        }
        if let Some(v) = self.amount_cents {
            rec.amount_cents = v;
        }
        if let Some(v) = &self.voucher_code {
            rec.voucher_code = v.clone();
        }
        if let Some(v) = &self.notes {
            rec.notes = v.clone();
        }
    }
}

/// Sparse user patch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPatch {
    /// New display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// New email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// New gender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    /// `Some(None)` clears the age.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<Option<u8>>,
    /// New marital status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marital_status: Option<MaritalStatus>,
    /// New membership tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub membership: Option<MembershipTier>,
}

impl UserPatch {
    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies this patch in place to `rec`.
    pub fn apply_to(&self, rec: &mut UserData) {
        if let Some(v) = &self.display_name {
            rec.display_name = v.clone();
        }
        if let Some(v) = &self.email {
            rec.email = v.clone();
        }
        if let Some(v) = self.gender {
            rec.gender = v;
        }
        if let Some(v) = self.age {
            rec.age = v;
        }
        if let Some(v) = self.marital_status {
            rec.marital_status = v;
        }
        if let Some(v) = self.membership {
            rec.membership = v;
        }
    }
}

/// Field-level merge for any collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "patch", rename_all = "lowercase")]
pub enum EntityPatch {
    /// Event fields.
    Event(EventPatch),
    /// Booking fields.
    Booking(BookingPatch),
    /// User fields.
    User(UserPatch),
}

impl EntityPatch {
    /// Collection the patch targets.
    pub fn collection(&self) -> Collection {
        match self {
            Self::Event(_) => Collection::Events,
            Self::Booking(_) => Collection::Bookings,
            Self::User(_) => Collection::Users,
        }
    }

    /// Returns true when no fields are set.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Event(p) => p.is_empty(),
            Self::Booking(p) => p.is_empty(),
            Self::User(p) => p.is_empty(),
        }
    }

    /// Merges into `data`. Returns false when collections differ.
    pub fn apply_to(&self, data: &mut EntityData) -> bool {
        match (self, data) {
            (Self::Event(p), EntityData::Event(rec)) => p.apply_to(rec),
            (Self::Booking(p), EntityData::Booking(rec)) => p.apply_to(rec),
            (Self::User(p), EntityData::User(rec)) => p.apply_to(rec),
            _ => return false,
        }
        true
    }

    /// Visits every cross-entity reference carried by the patch.
    pub fn map_refs(&mut self, mut f: impl FnMut(&mut EntityId)) {
        if let Self::Event(EventPatch {
            participants: Some(participants),
            ..
        }) = self
        {
            for participant in participants {
                f(&mut participant.user_id);
            }
        }
    }
}
