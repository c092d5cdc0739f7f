//! The event catalog: every named message a client can send and every
//! named message the coordinator can push.
//!
//! Frames are adjacently tagged:
//!
//! ```text
//! {"event": "create-session", "args": ["R1", "u-1", "set-9", "Crypt"]}
//! {"event": "log", "args": "Bea has connected"}
//! {"event": "resync-board"}
//! ```
//!
//! Multi-argument events carry a positional array (room id first where
//! the event is room-scoped). Single-argument events carry the bare value
//! and zero-argument events omit `args`.

use serde::{Deserialize, Serialize};

use crate::{
    AccessRequest, Action, RequestId, RollContext, RollOutcome, RoomId,
    SetRef, Snapshot, Token, TurnSubmission, UserId,
};

/// Client → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// First frame on every connection: protocol version and auth token.
    Handshake(u32, Option<String>),

    /// Keepalive carrying the client's clock.
    Heartbeat(u64),

    /// `room_id, user_id, set_ref, name`
    CreateSession(RoomId, UserId, SetRef, String),

    /// `room_id`: the host finished loading and asks for the go-ahead.
    ConfirmReady(RoomId),

    /// `user_id, name, room_id`
    JoinSession(UserId, String, RoomId),

    /// `room_id, user_id, name, actions`
    SubmitTurn(RoomId, UserId, String, Vec<Action>),

    /// `room_id, snapshot`
    StartTurn(RoomId, Snapshot),

    /// `room_id`
    EndTurn(RoomId),

    /// `room_id, user_id, name, token`
    RequestAccess(RoomId, UserId, String, Token),

    /// `room_id, request_id`
    GrantAccess(RoomId, RequestId),

    /// `room_id, request_id`
    DeclineAccess(RoomId, RequestId),

    /// `room_id`
    ListAccessRequests(RoomId),

    /// `room_id, action, user_id, message`
    ApproveAction(RoomId, Action, UserId, String),

    /// `room_id, roll_context`
    CancelRollRequest(RoomId, RollContext),

    /// `room_id, message`
    BroadcastLog(RoomId, String),

    /// `room_id, roll_context`
    RequestRoll(RoomId, RollContext),

    /// `room_id, value, name, action_index`
    SubmitRoll(RoomId, u8, String, usize),

    /// `action`: re-broadcast an approved action to the sender's rooms.
    RelayAction(Action),
}

impl ClientEvent {
    /// Every inbound event name, in catalog order.
    pub const NAMES: &'static [&'static str] = &[
        "handshake",
        "heartbeat",
        "create-session",
        "confirm-ready",
        "join-session",
        "submit-turn",
        "start-turn",
        "end-turn",
        "request-access",
        "grant-access",
        "decline-access",
        "list-access-requests",
        "approve-action",
        "cancel-roll-request",
        "broadcast-log",
        "request-roll",
        "submit-roll",
        "relay-action",
    ];

    /// Whether `name` is an inbound event this catalog defines.
    pub fn is_known(name: &str) -> bool {
        Self::NAMES.contains(&name)
    }

    /// The wire name of this event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(..) => "handshake",
            Self::Heartbeat(_) => "heartbeat",
            Self::CreateSession(..) => "create-session",
            Self::ConfirmReady(_) => "confirm-ready",
            Self::JoinSession(..) => "join-session",
            Self::SubmitTurn(..) => "submit-turn",
            Self::StartTurn(..) => "start-turn",
            Self::EndTurn(_) => "end-turn",
            Self::RequestAccess(..) => "request-access",
            Self::GrantAccess(..) => "grant-access",
            Self::DeclineAccess(..) => "decline-access",
            Self::ListAccessRequests(_) => "list-access-requests",
            Self::ApproveAction(..) => "approve-action",
            Self::CancelRollRequest(..) => "cancel-roll-request",
            Self::BroadcastLog(..) => "broadcast-log",
            Self::RequestRoll(..) => "request-roll",
            Self::SubmitRoll(..) => "submit-roll",
            Self::RelayAction(_) => "relay-action",
        }
    }
}

/// Only the `event` tag of a frame, with `args` ignored.
///
/// Lets the server tell a frame with a known event but bad arguments
/// apart from one that isn't an event at all.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventTag {
    pub event: String,
}

/// Coordinator → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// `user_id, display_name` as resolved by the identity provider.
    HandshakeAck(UserId, String),

    /// `client_time, server_time` (server time in ms since the connection opened).
    HeartbeatAck(u64, u64),

    /// The room exists and the caller may proceed.
    SessionReady(RoomId),

    /// Human-readable reason an operation was rejected.
    OperationFailed(String),

    /// A line for the game log.
    Log(String),

    /// `room_id, set_ref, snapshot`: "you are the host, resume".
    HostResume(RoomId, SetRef, Option<Snapshot>),

    /// `room_id, set_ref, role, snapshot`
    GuestJoin(RoomId, SetRef, Option<Token>, Option<Snapshot>),

    /// Access to one token for this turn; `null` revokes everything.
    GrantToken(Option<Token>),

    /// Host only: unrestricted access to every token this turn.
    GrantAllAccess,

    /// No character is actionable until the next turn starts.
    RevokeTurnAccess,

    /// Refresh the local backup copy of the game state.
    RefreshSnapshot,

    /// Redraw the board from the local backup copy.
    ResyncBoard,

    /// Host only: the full pending access-request list.
    PendingAccessRequests(Vec<AccessRequest>),

    /// Host only: every submission of the closing turn, in order.
    ActionQueue(Vec<TurnSubmission>),

    /// Apply this action to the local game state.
    ExecuteAction(Action),

    /// The receiving player must roll for this action.
    EnableRoll(RollContext),

    /// The pending roll was cancelled.
    DisableRoll,

    /// Host only: `outcome, action_index`.
    RollOutcome(RollOutcome, usize),
}

impl ServerEvent {
    /// The wire name of this event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandshakeAck(..) => "handshake-ack",
            Self::HeartbeatAck(..) => "heartbeat-ack",
            Self::SessionReady(_) => "session-ready",
            Self::OperationFailed(_) => "operation-failed",
            Self::Log(_) => "log",
            Self::HostResume(..) => "host-resume",
            Self::GuestJoin(..) => "guest-join",
            Self::GrantToken(_) => "grant-token",
            Self::GrantAllAccess => "grant-all-access",
            Self::RevokeTurnAccess => "revoke-turn-access",
            Self::RefreshSnapshot => "refresh-snapshot",
            Self::ResyncBoard => "resync-board",
            Self::PendingAccessRequests(_) => "pending-access-requests",
            Self::ActionQueue(_) => "action-queue",
            Self::ExecuteAction(_) => "execute-action",
            Self::EnableRoll(_) => "enable-roll",
            Self::DisableRoll => "disable-roll",
            Self::RollOutcome(..) => "roll-outcome",
        }
    }
}
