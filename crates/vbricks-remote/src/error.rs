//! Error types for vbricks-remote.

use thiserror::Error;
use vbricks_core::CoreError;

/// Result type alias for remote-control operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors raised on a remote-control connection.
///
/// Every variant tears the connection down. Nothing reconnects on its own.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Digest did not match the shared password
    #[error("authentication failed with {0}")]
    AuthFailed(String),

    /// Peer sent something outside the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer did not answer in time
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Host is not registered
    #[error("unknown remote host: {0}")]
    UnknownHost(String),

    /// Engine-side failure
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RemoteError::AuthFailed("10.0.0.2".into());
        assert_eq!(err.to_string(), "authentication failed with 10.0.0.2");
        let err: RemoteError = CoreError::NotFound("sw1".into()).into();
        assert_eq!(err.to_string(), "not found: sw1");
    }
}
