//! # Tavern
//!
//! Real-time session coordinator for hosted tabletop games.
//!
//! One client hosts a game session and owns the authoritative game
//! state; guests join it, ask the host for control of characters, submit
//! their turns, and roll dice when the host asks. Tavern relays all of it
//! over WebSockets, enforces who may do what, and keeps the last
//! snapshot around so a player who reconnects picks up where they were.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tavern::prelude::*;
//!
//! # async fn run() -> Result<(), TavernError> {
//! init_tracing();
//! let server = TavernServerBuilder::new()
//!     .bind("0.0.0.0:8080")
//!     .build(DevAuthenticator)
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod error;
mod handler;
mod server;
mod telemetry;

pub use config::{
    ConfigError, ENV_BIND, ENV_HANDSHAKE_TIMEOUT, ENV_HEARTBEAT_TIMEOUT, ENV_IDLE_TIMEOUT,
    ENV_REAP_INTERVAL, ServerConfig,
};
pub use error::TavernError;
pub use server::{TavernServer, TavernServerBuilder};
pub use telemetry::init_tracing;

pub mod prelude {
    pub use crate::{
        ConfigError, ServerConfig, TavernError, TavernServer, TavernServerBuilder, init_tracing,
    };

    pub use tavern_identity::{Authenticator, DevAuthenticator, Identity, IdentityError};
    pub use tavern_protocol::{
        Action, ClientEvent, DIE_SIDES, PROTOCOL_VERSION, RequestId, RollContext, RollOutcome, RoomId,
        ServerEvent, SetRef, Snapshot, Token, UserId,
    };
    pub use tavern_room::{MemoryStore, NoStore, RoomConfig, SnapshotStore, StoreError};
}
