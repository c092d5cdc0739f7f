//! Unified error type for the Tavern server.

use tavern_identity::IdentityError;
use tavern_protocol::ProtocolError;
use tavern_room::RoomError;
use tavern_transport::TransportError;

use crate::ConfigError;

/// Top-level error that wraps every crate-specific error.
///
/// `Display` is transparent, so the message a client sees in
/// `operation-failed` is the underlying error's own text.
#[derive(Debug, thiserror::Error)]
pub enum TavernError {
    /// A transport-level error (accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, bad handshake).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The identity provider rejected the client.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A room operation was rejected.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// The server configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
