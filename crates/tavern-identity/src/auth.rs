//! Authentication hook for resolving who is on the other end of a
//! connection.
//!
//! Tavern doesn't implement authentication itself: that's the identity
//! provider's job (Firebase, Auth0, a custom JWT issuer...). The server
//! calls [`Authenticator::authenticate`] once per connection, during the
//! handshake, and trusts the [`Identity`] it returns for the connection's
//! lifetime.

use std::future::Future;

use tavern_protocol::UserId;

use crate::IdentityError;

/// A resolved user: stable id plus the name shown to other players.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Validates a client's token and returns its identity.
///
/// The returned future must be `Send`: each connection handler runs on
/// its own Tokio task and awaits it there. Implementors can still write
/// `async fn authenticate`.
///
/// # Example
///
/// ```rust
/// use tavern_identity::{Authenticator, Identity, IdentityError};
///
/// /// Everyone is Alice. Tests only.
/// struct AlwaysAlice;
///
/// impl Authenticator for AlwaysAlice {
///     async fn authenticate(&self, _token: &str) -> Result<Identity, IdentityError> {
///         Ok(Identity::new("alice", "Alice"))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Resolves `token` to an identity.
    ///
    /// # Errors
    /// Returns [`IdentityError`] when the token is missing or rejected.
    fn authenticate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Identity, IdentityError>> + Send;
}

/// Development authenticator: the token *is* the identity.
///
/// Accepts `"<user_id>:<display name>"` or a bare `"<user_id>"` (the id
/// doubles as the display name). Never use this in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevAuthenticator;

impl Authenticator for DevAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, IdentityError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(IdentityError::MissingToken);
        }

        let (user_id, name) = match token.split_once(':') {
            Some((id, name)) => (id.trim(), name.trim()),
            None => (token, token),
        };
        if user_id.is_empty() {
            return Err(IdentityError::AuthFailed("empty user id".into()));
        }

        let name = if name.is_empty() { user_id } else { name };
        tracing::debug!(user_id, "dev identity accepted");
        Ok(Identity::new(user_id, name))
    }
}
