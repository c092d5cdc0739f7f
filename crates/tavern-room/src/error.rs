//! Error types for the room layer.
//!
//! Every variant is terminal for the one request that caused it: the
//! connection handler turns it into an `operation-failed` event for the
//! triggering connection and the room carries on.

use tavern_protocol::{DIE_SIDES, RequestId, RoomId, UserId};

use crate::TurnPhase;

/// Errors that can occur during room operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// No session is registered under this room id.
    #[error("Couldn't find game: '{0}'")]
    NotFound(RoomId),

    /// A session with this room id already exists.
    #[error("Name: '{0}' already taken!")]
    AlreadyExists(RoomId),

    /// The caller may not perform this operation: either it is host-only,
    /// or the caller tried to act under another user's id.
    #[error("'{user}' is not allowed to {operation}")]
    Unauthorized {
        user: UserId,
        operation: &'static str,
    },

    /// The caller's connection has not joined this room.
    #[error("'{0}' has not joined game '{1}'")]
    NotAMember(UserId, RoomId),

    /// The access request was already resolved (or never existed).
    #[error("access request {0} is no longer pending")]
    UnknownAccessRequest(RequestId),

    /// Nobody was asked to roll for this action.
    #[error("no roll is pending for action {0}")]
    NoPendingRoll(usize),

    /// The roll for this action already has an outcome.
    #[error("the roll for action {0} is already resolved")]
    RollAlreadyResolved(usize),

    /// The submitted value can't come off the die.
    #[error("roll {0} is outside 1-{max}", max = DIE_SIDES)]
    InvalidRoll(u8),

    /// The turn isn't in a phase that allows this operation.
    #[error("cannot {operation} while the turn is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: TurnPhase,
    },

    /// The connection issued a room-less operation without being in any room.
    #[error("not in any game")]
    NotInAnySession,

    /// The room actor is gone or its command channel is closed.
    #[error("game '{0}' is unavailable")]
    Unavailable(RoomId),
}
