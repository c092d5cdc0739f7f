//! Session coordination for Tavern.
//!
//! Each hosted game is a [`Session`] owned by a room actor: a Tokio task
//! that applies operations one at a time and fans the resulting events
//! out to member connections. The [`SessionRegistry`] maps room ids to
//! running rooms.
//!
//! # Key types
//!
//! - [`SessionRegistry`]: creates, finds, and reaps rooms
//! - [`RoomHandle`]: send operations to a running room
//! - [`Session`]: membership, access requests, the turn queue, and rolls
//! - [`TurnPhase`], [`RollState`]: the per-session state machines
//! - [`SnapshotStore`]: where snapshots live between turns

mod config;
mod error;
mod registry;
mod room;
mod session;
mod store;

pub use config::{RollState, RoomConfig, TurnPhase};
pub use error::RoomError;
pub use registry::{SessionRegistry, stop_idle_rooms};
pub use room::{Outbox, RoomHandle, RoomInfo, RoomRequest};
pub use session::{Caller, Outbound, Recipient, Session};
pub use store::{MemoryStore, NoStore, SnapshotStore, StoreError};
