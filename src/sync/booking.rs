//! Booking flows. A booking and its event participant are written in one
//! local transaction, participant first.

use tracing::info;

use crate::{
    booking::rules::{
        check_can_book, check_eligibility, find_participant, quote_price, status_after_booking,
        status_after_cancellation, BookingDetails, InvariantViolation,
    },
    entity::{
        BookingData, BookingStatus, Entity, EntityData, EntityPatch, EventData, EventPatch,
        Participant, ParticipantStatus,
    },
    types::{now_ms, Collection, EntityId, EntityKey},
};

use super::engine::{cancel_patch, Engine, SyncError, Txn};

/// Records written by a successful booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    /// Event after the participant list changed.
    pub event: Entity,
    /// Newly created booking.
    pub booking: Entity,
}

/// Records written by a cancellation. `booking` is `None` when only the
/// participant entry existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Event after the participant list changed.
    pub event: Entity,
    /// Cancelled booking record.
    pub booking: Option<Entity>,
}

impl Engine {
    /// Books `user_id` on `event_id`.
    ///
    /// Checks run against local data in this order: duplicate booking,
    /// bookable status, capacity, eligibility, voucher. Nothing is written
    /// unless all pass.
    pub fn book_event(
        &mut self,
        event_id: &EntityId,
        user_id: &EntityId,
        details: BookingDetails,
    ) -> Result<BookingOutcome, SyncError> {
        let event_entity = self.resolve(Collection::Events, event_id)?;
        let event = expect_event(&event_entity)?;
        let event_id = event_entity.id();

        check_can_book(&event_id, &event, user_id, &self.ids)?;
        check_eligibility(&event.eligibility, &details)?;
        let quote = quote_price(&event.pricing, &details)?;

        let now = now_ms();
        let user_id = self.ids.canonical(user_id);
        let participant = Participant {
            user_id: user_id.clone(),
            status: ParticipantStatus::Pending,
            paid: false,
            voucher: quote.voucher.clone(),
            joined_at_ms: now,
        };
        let booking = BookingData {
            event_id,
            user_id,
            status: BookingStatus::Pending,
            amount_cents: quote.amount_cents,
            voucher_code: quote.voucher.map(|v| v.code),
            notes: details.notes,
            booked_at_ms: now,
        };

        let outcome =
            self.run_txn(|engine, txn| engine.txn_book(txn, event_entity, participant, booking))?;
        info!(
            event = %outcome.event.id(),
            booking = %outcome.booking.id(),
            "booking recorded"
        );
        Ok(outcome)
    }

    /// Cancels the user's seat and booking on `event_id`.
    pub fn cancel_booking(
        &mut self,
        event_id: &EntityId,
        user_id: &EntityId,
    ) -> Result<CancelOutcome, SyncError> {
        let event_entity = self.resolve(Collection::Events, event_id)?;
        let event = expect_event(&event_entity)?;
        let booking = self.find_booking(&event_entity.id(), user_id)?;

        if find_participant(&event, user_id, &self.ids).is_none() && booking.is_none() {
            return Err(InvariantViolation::NotBooked {
                event_id: event_entity.id(),
                user_id: user_id.clone(),
            }
            .into());
        }

        let user_id = user_id.clone();
        self.run_txn(|engine, txn| {
            let event = engine.txn_remove_participant(txn, event_entity, &user_id)?;
            let booking = match booking {
                Some(booking) => Some(engine.txn_update(txn, booking, cancel_patch())?),
                None => None,
            };
            Ok(CancelOutcome { event, booking })
        })
    }

    /// Generic creation path for bookings; no pricing or eligibility checks.
    pub(super) fn create_booking(&mut self, booking: BookingData) -> Result<BookingOutcome, SyncError> {
        if booking.status == BookingStatus::Cancelled {
            return Err(InvariantViolation::InvalidRecord(
                "cannot create a cancelled booking".to_string(),
            )
            .into());
        }
        let event_entity = self.resolve(Collection::Events, &booking.event_id)?;
        let event = expect_event(&event_entity)?;
        check_can_book(&event_entity.id(), &event, &booking.user_id, &self.ids)?;

        let participant = Participant {
            user_id: self.ids.canonical(&booking.user_id),
            status: match booking.status {
                BookingStatus::Confirmed => ParticipantStatus::Confirmed,
                _ => ParticipantStatus::Pending,
            },
            paid: false,
            voucher: None,
            joined_at_ms: booking.booked_at_ms,
        };
        let booking = BookingData {
            event_id: event_entity.id(),
            user_id: self.ids.canonical(&booking.user_id),
            ..booking
        };
        self.run_txn(|engine, txn| engine.txn_book(txn, event_entity, participant, booking))
    }

    fn txn_book(
        &mut self,
        txn: &mut Txn,
        event_entity: Entity,
        participant: Participant,
        booking: BookingData,
    ) -> Result<BookingOutcome, SyncError> {
        let mut next = expect_event(&event_entity)?;
        next.participants.retain(|p| p.is_active());
        next.participants.push(participant);

        let mut patch = EventPatch {
            participants: Some(next.participants.clone()),
            ..EventPatch::default()
        };
        patch.status = status_after_booking(&next);

        let event = self.txn_update(txn, event_entity, EntityPatch::Event(patch))?;

        let now = now_ms();
        let key = EntityKey::local(self.allocate_local());
        let booking = self.txn_insert(
            txn,
            Entity {
                key,
                created_at_ms: now,
                updated_at_ms: now,
                data: EntityData::Booking(booking),
            },
        )?;
        Ok(BookingOutcome { event, booking })
    }

    /// Drops the user's active participant entry, reopening a full event.
    /// Returns the event unchanged when the user holds no seat.
    pub(super) fn txn_remove_participant(
        &mut self,
        txn: &mut Txn,
        event_entity: Entity,
        user_id: &EntityId,
    ) -> Result<Entity, SyncError> {
        let mut next = expect_event(&event_entity)?;
        let Some(index) = find_participant(&next, user_id, &self.ids) else {
            return Ok(event_entity);
        };
        next.participants.remove(index);

        let patch = EventPatch {
            status: status_after_cancellation(&next),
            participants: Some(next.participants),
            ..EventPatch::default()
        };
        self.txn_update(txn, event_entity, EntityPatch::Event(patch))
    }

    pub(super) fn txn_confirm_participant(
        &mut self,
        txn: &mut Txn,
        event_entity: Entity,
        user_id: &EntityId,
    ) -> Result<Entity, SyncError> {
        let mut next = expect_event(&event_entity)?;
        let Some(index) = find_participant(&next, user_id, &self.ids) else {
            return Ok(event_entity);
        };
        next.participants[index].status = ParticipantStatus::Confirmed;

        let patch = EventPatch {
            participants: Some(next.participants),
            ..EventPatch::default()
        };
        self.txn_update(txn, event_entity, EntityPatch::Event(patch))
    }
}

fn expect_event(entity: &Entity) -> Result<EventData, SyncError> {
    entity.as_event().cloned().ok_or_else(|| {
        InvariantViolation::CollectionMismatch {
            expected: Collection::Events,
            actual: entity.collection(),
        }
        .into()
    })
}
