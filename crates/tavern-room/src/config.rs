//! Room configuration and the two per-session state machines.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tavern_protocol::RollOutcome;

// ---------------------------------------------------------------------------
// RoomConfig
// ---------------------------------------------------------------------------

/// Settings shared by every room the registry creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Capacity of each room actor's command channel. Senders wait when
    /// it is full.
    pub channel_size: usize,

    /// How long a room may sit with no connected members before the
    /// registry reaps it.
    pub idle_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            channel_size: 64,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// TurnPhase
// ---------------------------------------------------------------------------

/// Where a session is in its turn cycle.
///
/// ```text
/// Idle ──start──→ TurnOpen ──end──→ TurnClosing
///                    ↑                   │
///                    └──────start────────┘
/// ```
///
/// `TurnClosing` falls back to `Idle` in spirit once the host starts the
/// next turn; since that same call opens the new turn, the session moves
/// straight to `TurnOpen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TurnPhase {
    /// No turn has started yet.
    #[default]
    Idle,
    /// Players are submitting actions.
    TurnOpen,
    /// The host is resolving the submitted queue.
    TurnClosing,
}

impl TurnPhase {
    /// Whether players may submit actions.
    pub fn accepts_submissions(self) -> bool {
        self == Self::TurnOpen
    }

    /// Whether the host may close the turn.
    pub fn can_end(self) -> bool {
        self == Self::TurnOpen
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::TurnOpen => write!(f, "open"),
            Self::TurnClosing => write!(f, "closing"),
        }
    }
}

// ---------------------------------------------------------------------------
// RollState
// ---------------------------------------------------------------------------

/// Resolution state of one roll-gated action.
///
/// ```text
/// Unresolved ──request──→ AwaitingRoll ──submit──→ Resolved(outcome)
///      ↑                       │
///      └────────cancel─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollState {
    #[default]
    Unresolved,
    AwaitingRoll,
    Resolved(RollOutcome),
}

impl RollState {
    /// Whether `target` is reachable from this state in one step.
    ///
    /// Re-requesting an outstanding roll is allowed so the host can
    /// re-prompt a player who reconnected.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Unresolved, Self::AwaitingRoll)
                | (Self::AwaitingRoll, Self::AwaitingRoll)
                | (Self::AwaitingRoll, Self::Unresolved)
                | (Self::AwaitingRoll, Self::Resolved(_))
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_config_default() {
        let config = RoomConfig::default();
        assert_eq!(config.channel_size, 64);
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_only_open_turn_accepts_submissions() {
        assert!(!TurnPhase::Idle.accepts_submissions());
        assert!(TurnPhase::TurnOpen.accepts_submissions());
        assert!(!TurnPhase::TurnClosing.accepts_submissions());
    }

    #[test]
    fn test_only_open_turn_can_end() {
        assert!(!TurnPhase::Idle.can_end());
        assert!(TurnPhase::TurnOpen.can_end());
        assert!(!TurnPhase::TurnClosing.can_end());
    }

    #[test]
    fn test_turn_phase_display() {
        assert_eq!(TurnPhase::TurnClosing.to_string(), "closing");
    }

    #[test]
    fn test_roll_state_transitions() {
        use RollState::*;
        let success = Resolved(RollOutcome::Success);

        assert!(Unresolved.can_transition_to(AwaitingRoll));
        assert!(AwaitingRoll.can_transition_to(Unresolved));
        assert!(AwaitingRoll.can_transition_to(success));
        assert!(!Unresolved.can_transition_to(success));
        assert!(!success.can_transition_to(AwaitingRoll));
        assert!(!success.can_transition_to(Unresolved));
    }

    #[test]
    fn test_only_resolved_is_terminal() {
        assert!(!RollState::Unresolved.is_terminal());
        assert!(!RollState::AwaitingRoll.is_terminal());
        assert!(RollState::Resolved(RollOutcome::Failure).is_terminal());
    }
}
