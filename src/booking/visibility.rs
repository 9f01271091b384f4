//! Read-time membership policies. No I/O.

use crate::{
    entity::{Entity, EventData},
    types::MembershipTier,
};

/// Maximum number of events listed to `tier`; `None` is unlimited.
pub fn visibility_limit(tier: MembershipTier) -> Option<usize> {
    match tier {
        MembershipTier::Visitor => Some(3),
        MembershipTier::Registered => Some(12),
        MembershipTier::Vip | MembershipTier::Vvip => None,
    }
}

/// Truncates an already filtered and sorted list to the tier quota.
///
/// Idempotent: applying it to its own output returns the same list.
pub fn apply_membership_visibility_limit<T>(mut events: Vec<T>, tier: MembershipTier) -> Vec<T> {
    if let Some(limit) = visibility_limit(tier) {
        events.truncate(limit);
    }
    events
}

/// Keeps events whose per-tier listing flag allows `tier`. Non-event records are dropped.
pub fn filter_visible_for_tier(entities: Vec<Entity>, tier: MembershipTier) -> Vec<Entity> {
    entities
        .into_iter()
        .filter(|entity| entity.as_event().is_some_and(|e| e.visibility.allows(tier)))
        .collect()
}

/// True when `tier` may see who is attending.
pub fn participants_visible(tier: MembershipTier) -> bool {
    matches!(tier, MembershipTier::Vip | MembershipTier::Vvip)
}

/// Clears the participant list unless `tier` may see it.
pub fn redact_participants(mut event: EventData, tier: MembershipTier) -> EventData {
    if !participants_visible(tier) {
        event.participants.clear();
    }
    event
}
