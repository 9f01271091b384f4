use thiserror::Error;

use crate::{
    core::{ids::IdTable, status::EventStatus},
    entity::{Eligibility, EventData, Pricing, VoucherUsage},
    types::{Collection, EntityId, Gender, MaritalStatus},
};

/// Rule violation detected before any write. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("user {user_id} already booked event {event_id}")]
    AlreadyBooked { event_id: EntityId, user_id: EntityId },
    #[error("event {event_id} is full ({max} participants)")]
    EventFull { event_id: EntityId, max: u32 },
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: EventStatus, to: EventStatus },
    #[error("event {event_id} is {status} and not open for booking")]
    NotBookable { event_id: EntityId, status: EventStatus },
    #[error("not eligible: {0}")]
    NotEligible(String),
    #[error("unknown voucher code {0:?}")]
    UnknownVoucher(String),
    #[error("user {user_id} has no booking on event {event_id}")]
    NotBooked { event_id: EntityId, user_id: EntityId },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("expected a {expected} record, got {actual}")]
    CollectionMismatch { expected: Collection, actual: Collection },
}

/// Attendee-supplied booking request fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BookingDetails {
    /// Selects the gender price.
    pub gender: Gender,
    /// Checked against the event age range.
    pub age: Option<u8>,
    /// Checked against the event marital-status filter.
    pub marital_status: Option<MaritalStatus>,
    /// Voucher to apply.
    pub voucher_code: Option<String>,
    /// Copied onto the booking.
    pub notes: String,
}

/// Amount due for one seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    /// Seat price after any voucher.
    pub amount_cents: u64,
    /// Voucher consumed by the quote, if one applied.
    pub voucher: Option<VoucherUsage>,
}

/// Structural checks applied when an event is created and after every patch.
pub fn validate_event(
    event_id: &EntityId,
    event: &EventData,
    ids: &IdTable,
) -> Result<(), InvariantViolation> {
    if event.name.trim().is_empty() {
        return Err(InvariantViolation::InvalidRecord(
            "event name must not be empty".to_string(),
        ));
    }
    if event.max_participants == Some(0) {
        return Err(InvariantViolation::InvalidRecord(
            "max_participants must be positive when set".to_string(),
        ));
    }
    if let (Some(min), Some(max)) = (event.eligibility.min_age, event.eligibility.max_age) {
        if min > max {
            return Err(InvariantViolation::InvalidRecord(format!(
                "age range {min}..={max} is empty"
            )));
        }
    }

    let active: Vec<&EntityId> = event
        .participants
        .iter()
        .filter(|p| p.is_active())
        .map(|p| &p.user_id)
        .collect();
    for (i, user_id) in active.iter().enumerate() {
        if active[..i].iter().any(|other| ids.same(other, user_id)) {
            return Err(InvariantViolation::AlreadyBooked {
                event_id: event_id.clone(),
                user_id: (*user_id).clone(),
            });
        }
    }

    if let Some(max) = event.max_participants {
        if active.len() > max as usize {
            return Err(InvariantViolation::EventFull {
                event_id: event_id.clone(),
                max,
            });
        }
    }
    Ok(())
}

/// Index of the user's active participant entry.
pub fn find_participant(event: &EventData, user_id: &EntityId, ids: &IdTable) -> Option<usize> {
    event
        .participants
        .iter()
        .position(|p| p.is_active() && ids.same(&p.user_id, user_id))
}

/// Duplicate, bookability, and capacity checks, in that order.
pub fn check_can_book(
    event_id: &EntityId,
    event: &EventData,
    user_id: &EntityId,
    ids: &IdTable,
) -> Result<(), InvariantViolation> {
    if find_participant(event, user_id, ids).is_some() {
        return Err(InvariantViolation::AlreadyBooked {
            event_id: event_id.clone(),
            user_id: user_id.clone(),
        });
    }

    let full = |max: u32| InvariantViolation::EventFull {
        event_id: event_id.clone(),
        max,
    };
    match event.status {
        EventStatus::Published => {}
        EventStatus::Full => {
            return Err(full(
                event
                    .max_participants
                    .unwrap_or(event.active_participants() as u32),
            ));
        }
        status => {
            return Err(InvariantViolation::NotBookable {
                event_id: event_id.clone(),
                status,
            });
        }
    }

    match event.max_participants {
        Some(max) if event.active_participants() >= max as usize => Err(full(max)),
        _ => Ok(()),
    }
}

/// Rejects `details` that fall outside the event's eligibility rules.
pub fn check_eligibility(
    eligibility: &Eligibility,
    details: &BookingDetails,
) -> Result<(), InvariantViolation> {
    if eligibility.min_age.is_some() || eligibility.max_age.is_some() {
        let Some(age) = details.age else {
            return Err(InvariantViolation::NotEligible(
                "age is required for this event".to_string(),
            ));
        };
        if eligibility.min_age.is_some_and(|min| age < min) {
            return Err(InvariantViolation::NotEligible(format!("age {age} is below the minimum")));
        }
        if eligibility.max_age.is_some_and(|max| age > max) {
            return Err(InvariantViolation::NotEligible(format!("age {age} is above the maximum")));
        }
    }

    if !eligibility.marital_statuses.is_empty() {
        let accepted = details
            .marital_status
            .is_some_and(|status| eligibility.marital_statuses.contains(&status));
        if !accepted {
            return Err(InvariantViolation::NotEligible(
                "marital status is not accepted for this event".to_string(),
            ));
        }
    }
    Ok(())
}

/// Gender price minus the voucher discount, never below zero.
pub fn quote_price(pricing: &Pricing, details: &BookingDetails) -> Result<PriceQuote, InvariantViolation> {
    let base = match details.gender {
        Gender::Male => pricing.male_price_cents,
        Gender::Female => pricing.female_price_cents,
    };

    let voucher = match details.voucher_code.as_deref() {
        None | Some("") => None,
        Some(code) => {
            let voucher = pricing
                .vouchers
                .iter()
                .find(|v| v.code.eq_ignore_ascii_case(code))
                .ok_or_else(|| InvariantViolation::UnknownVoucher(code.to_string()))?;
            Some(VoucherUsage {
                code: voucher.code.clone(),
                discount_cents: voucher.discount_cents.min(base),
            })
        }
    };

    let discount = voucher.as_ref().map_or(0, |v| v.discount_cents);
    Ok(PriceQuote {
        amount_cents: base.saturating_sub(discount),
        voucher,
    })
}

/// Status to apply after a seat was taken, if it changes.
pub fn status_after_booking(event: &EventData) -> Option<EventStatus> {
    (event.status == EventStatus::Published && event.is_at_capacity()).then_some(EventStatus::Full)
}

/// Status to apply after a seat was freed, if it changes.
pub fn status_after_cancellation(event: &EventData) -> Option<EventStatus> {
    (event.status == EventStatus::Full && !event.is_at_capacity()).then_some(EventStatus::Published)
}

/// Rejects `from -> to` unless allowed. Same-state requests are accepted.
pub fn check_transition(from: EventStatus, to: EventStatus) -> Result<(), InvariantViolation> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(InvariantViolation::IllegalTransition { from, to })
    }
}
