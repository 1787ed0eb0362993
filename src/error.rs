//! Error types surfaced by the connection subsystem.
//!
//! [`Error`] is the public taxonomy; [`ErrorInfo`](crate::protocol::ErrorInfo)
//! is the cloneable wire-level record that transitions and frame rejections
//! carry. Transport and server failures are classified back into taxonomy
//! variants by their error code range.

use thiserror::Error;

use crate::{connection::ConnectionState, protocol::ErrorInfo};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by connection operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A client option or argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A state move not present in the transition table was requested.
    #[error("invalid connection state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Transport-level failure (DNS, TCP, TLS, open timeout).
    #[error("connection failed: {0}")]
    Connection(ErrorInfo),
    /// Credentials were rejected; the connection is failed terminally.
    #[error("authentication failed: {0}")]
    Auth(ErrorInfo),
    /// The server rejected a frame or reported an internal error.
    #[error("server error: {0}")]
    Server(ErrorInfo),
    /// A malformed frame, bad ack serial, or unexpected resume rejection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Pending frames were rejected because the connection generation
    /// changed before they were acknowledged.
    #[error("connection reset: {0}")]
    ConnectionReset(ErrorInfo),
    /// A deadline elapsed before the awaited event arrived.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The operation is not available in the current connection state.
    #[error("operation not available in connection state {0:?}")]
    NotConnected(ConnectionState),
    /// The connection handle was dropped and the worker has exited.
    #[error("connection handle dropped")]
    Dropped,
}

impl Error {
    /// Classify a wire-level error record into a taxonomy variant.
    pub(crate) fn from_info(info: ErrorInfo) -> Self {
        if info.is_auth_error() {
            Self::Auth(info)
        } else if info.code == 80008 {
            Self::ConnectionReset(info)
        } else if (50000..60000).contains(&info.code) {
            Self::Server(info)
        } else {
            Self::Connection(info)
        }
    }
}
