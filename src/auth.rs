//! Authentication capability for the connection handshake.
//!
//! Token minting and capability calls belong to the REST sibling client; the
//! connection subsystem only needs fresh handshake query parameters per open
//! attempt. [`AuthProvider`] is that seam: the manager invokes it on a worker
//! task (never on the connection loop) immediately before each transport
//! open, so rotating credentials are always current.

use async_trait::async_trait;

use crate::protocol::ErrorInfo;

/// Query parameters contributed to the connection handshake.
pub type AuthParams = Vec<(String, String)>;

/// Source of fresh authentication parameters.
///
/// Implementations may block or perform I/O; the manager always calls them
/// off the connection loop. Failures with an authentication error code fail
/// the connection terminally without fallback retries.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Produce handshake parameters for one open attempt.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorInfo`] describing why credentials could not be
    /// produced.
    async fn auth_params(&self) -> Result<AuthParams, ErrorInfo>;
}

/// Direct key authentication.
pub(crate) struct KeyAuth(pub(crate) String);

#[async_trait]
impl AuthProvider for KeyAuth {
    async fn auth_params(&self) -> Result<AuthParams, ErrorInfo> {
        Ok(vec![("key".into(), self.0.clone())])
    }
}

/// Literal token authentication.
pub(crate) struct TokenAuth(pub(crate) String);

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn auth_params(&self) -> Result<AuthParams, ErrorInfo> {
        Ok(vec![("access_token".into(), self.0.clone())])
    }
}
