//! Wire protocol for Tavern.
//!
//! - **Types** ([`RoomId`], [`UserId`], [`Token`], [`Snapshot`], ...):
//!   the identities and opaque payloads the coordinator moves around.
//! - **Events** ([`ClientEvent`], [`ServerEvent`]): the named messages of
//!   the session protocol.
//! - **Codec** ([`Codec`], [`JsonCodec`]): frames to events and back.
//!
//! The protocol layer knows nothing about rooms or connections.
//!
//! ```text
//! Transport (frames) → Protocol (events) → Room (session state)
//! ```

mod codec;
mod error;
mod events;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use events::{ClientEvent, EventTag, ServerEvent};
pub use types::{
    AccessRequest, Action, DIE_SIDES, PROTOCOL_VERSION, ROLL_THRESHOLD,
    RequestId, RollContext, RollOutcome, RoomId, SetRef, Snapshot, Token,
    TurnSubmission, UserId,
};
