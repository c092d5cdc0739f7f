//! Identity boundary for Tavern.
//!
//! Tavern doesn't issue identities. Whoever runs the server plugs an
//! [`Authenticator`] into the handshake; it turns the client's token into
//! an [`Identity`]: a stable user id plus a display name. Every later
//! operation on that connection runs as that user.

mod auth;
mod error;

pub use auth::{Authenticator, DevAuthenticator, Identity};
pub use error::IdentityError;
