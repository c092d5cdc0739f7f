//! Error types for the identity layer.

/// Errors the identity provider can report during the handshake.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The handshake carried no token at all.
    #[error("missing credentials")]
    MissingToken,

    /// The token was malformed, expired, or rejected by the provider.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}
