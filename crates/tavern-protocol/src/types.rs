//! Identity and payload types that travel on the wire.
//!
//! Every identifier is a newtype around the string (or number) the client
//! sends, so a `RoomId` can never be passed where a `UserId` is expected.
//! `#[serde(transparent)]` keeps the wire form a bare JSON string.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol version clients must present in their handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Number of faces on the die used for roll-gated actions.
pub const DIE_SIDES: u8 = 20;

/// Minimum roll (inclusive) for a roll-gated action to succeed.
pub const ROLL_THRESHOLD: u8 = 14;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrows the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Room identifier, chosen by the host when creating a session.
    RoomId
);

string_id!(
    /// Stable user identity issued by the identity provider.
    UserId
);

string_id!(
    /// Reference to the persisted game definition a session started from.
    SetRef
);

string_id!(
    /// A character token: the piece a role assignment grants control of.
    Token
);

/// Identifier of one pending access request within a session.
///
/// Allocated from a per-session counter starting at 0, never reused, so a
/// host resolving request 1 after request 0 was removed still hits the
/// request it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A full serialized copy of the authoritative game state.
///
/// Produced and consumed by the rules engine on the host's client; the
/// coordinator stores and forwards it byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(pub String);

impl Snapshot {
    /// Borrows the serialized state.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An opaque player intent (move, use item, use ability, unequip).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(pub serde_json::Value);

/// A guest's request to control a character token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Stable handle the host uses to grant or decline this request.
    pub id: RequestId,
    /// Room the request was made in.
    pub room: RoomId,
    /// Display name of the requester at the time of the request.
    pub requester_name: String,
    /// Stable identity of the requester.
    pub requester_user_id: UserId,
    /// The token being asked for.
    pub requested_token: Token,
}

/// One player's actions for the current turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSubmission {
    pub user_id: UserId,
    pub display_name: String,
    pub actions: Vec<Action>,
}

/// Everything the host and the rolling player need to know about one
/// roll-gated action.
///
/// Only `user` and `action_index` are read by the coordinator; the rest
/// is for the humans reading the log and the rolling client's UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollContext {
    /// The player who must roll.
    pub user: UserId,
    /// Position of the gated action in the host's ordered action list.
    pub action_index: usize,
    /// Who is rolling, as shown in the log (usually the caster token).
    pub roller: String,
    /// What the roll is for, as shown in the log.
    pub ability: String,
    /// The gated action itself.
    pub action: Action,
}

/// Result of a submitted roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollOutcome {
    Success,
    Failure,
}

impl RollOutcome {
    /// Applies the fixed threshold rule: `value >= ROLL_THRESHOLD` succeeds.
    pub fn from_roll(value: u8) -> Self {
        if value >= ROLL_THRESHOLD {
            Self::Success
        } else {
            Self::Failure
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_ids_serialize_as_bare_strings() {
        let json = serde_json::to_value(RoomId::from("R1")).unwrap();
        assert_eq!(json, serde_json::json!("R1"));
    }

    #[test]
    fn test_token_accepts_non_ascii() {
        let token: Token = serde_json::from_str("\"🧙\"").unwrap();
        assert_eq!(token.as_str(), "🧙");
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId(3).to_string(), "#3");
    }

    #[test]
    fn test_roll_threshold_boundary() {
        assert_eq!(RollOutcome::from_roll(13), RollOutcome::Failure);
        assert_eq!(RollOutcome::from_roll(14), RollOutcome::Success);
    }

    #[test]
    fn test_roll_outcome_over_full_die_range() {
        for value in 1..=DIE_SIDES {
            let expected = value >= 14;
            assert_eq!(
                RollOutcome::from_roll(value).is_success(),
                expected,
                "roll {value}"
            );
        }
    }

    #[test]
    fn test_access_request_field_names() {
        let req = AccessRequest {
            id: RequestId(0),
            room: RoomId::from("R1"),
            requester_name: "Bea".into(),
            requester_user_id: UserId::from("B"),
            requested_token: Token::from("🧙"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 0);
        assert_eq!(json["requester_user_id"], "B");
        assert_eq!(json["requested_token"], "🧙");
    }
}
