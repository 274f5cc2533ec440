//! Error taxonomy surfaced at the dispatcher boundary.

use thiserror::Error;

/// Normalised error for every remote operation. Backends map their
/// transport-specific failures into these kinds; callers never see a raw
/// library error.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Credentials rejected, unreadable key file, wrong passphrase, or no
    /// usable agent identity.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The endpoint could not be reached at all.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// An established connection went away mid-operation.
    #[error("connection dropped: {0}")]
    NetworkDropped(String),

    /// TLS negotiation failed (FTPS).
    #[error("TLS failure: {0}")]
    TlsFailure(String),

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The bucket exists but access was refused at connect time.
    #[error("bucket access denied: {0}")]
    BucketAccessDenied(String),

    /// No backend connection is active.
    #[error("not connected")]
    NotConnected,

    /// The active backend does not implement this capability.
    #[error("operation not supported by this backend")]
    Unsupported,

    /// The caller's cancel flag was observed.
    #[error("transfer cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => RemoteError::NotFound(err.to_string()),
            ErrorKind::PermissionDenied => RemoteError::Permission(err.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::TimedOut => {
                RemoteError::NetworkUnreachable(err.to_string())
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => RemoteError::NetworkDropped(err.to_string()),
            _ => RemoteError::Internal(err.to_string()),
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn io_reset_maps_to_network_dropped() {
        let err: RemoteError = IoError::new(ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, RemoteError::NetworkDropped(_)));
    }

    #[test]
    fn io_refused_maps_to_unreachable() {
        let err: RemoteError = IoError::new(ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, RemoteError::NetworkUnreachable(_)));
    }

    #[test]
    fn display_carries_detail() {
        let err = RemoteError::AuthFailed("bad password".to_string());
        assert_eq!(err.to_string(), "authentication failed: bad password");
    }
}
