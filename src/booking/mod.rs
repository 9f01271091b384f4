//! Capacity, duplicate-booking, eligibility, pricing, and visibility rules.
//!
//! Everything here is pure and evaluated against local data, so it holds
//! while the server is unreachable.

/// Booking invariants, eligibility, and pricing.
pub mod rules;
/// Membership-tier read policies.
pub mod visibility;

pub use rules::{BookingDetails, InvariantViolation, PriceQuote};
pub use visibility::{apply_membership_visibility_limit, filter_visible_for_tier};
