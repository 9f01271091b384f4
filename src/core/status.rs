//! Event lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Event lifecycle state. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Being edited, not listed.
    #[default]
    Draft,
    /// Open for booking.
    Published,
    /// Every seat is taken.
    Full,
    /// Temporarily closed.
    Suspended,
    /// Closed for booking, about to happen.
    Ready,
    /// Called off.
    Cancelled,
}

impl EventStatus {
    /// States reachable in one step. This is also the set of actions offered to the UI.
    pub fn allowed_transitions(self) -> &'static [EventStatus] {
        use EventStatus::*;
        match self {
            Draft => &[Published, Cancelled],
            Published => &[Full, Ready, Suspended, Cancelled],
            Full => &[Ready, Published, Cancelled],
            Suspended => &[Published, Cancelled],
            Ready => &[Cancelled],
            Cancelled => &[],
        }
    }

    /// True when `to` is in [`Self::allowed_transitions`].
    pub fn can_transition_to(self, to: EventStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// True when no transition leaves this state.
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Full => "full",
            Self::Suspended => "suspended",
            Self::Ready => "ready",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
