//! Common error types for Kestrel.

use thiserror::Error;

/// Result type alias using Kestrel's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Kestrel operations.
///
/// The variants follow how a caller is expected to react: connection and
/// timeout failures may be retried, protocol and authentication failures end
/// the channel, resumption failures are recovered locally by a fresh
/// handshake, and `Closed` simply marks the end of a session.
#[derive(Debug, Error)]
pub enum Error {
    /// Dial, accept or socket failure
    #[error("connection error: {0}")]
    Connection(String),

    /// An I/O deadline elapsed
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed envelope or a route that does not belong to the current phase
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Signature, MAC or challenge verification failed
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The session could not be resumed
    #[error("resumption failed: {0}")]
    Resumption(String),

    /// Persisted identity or session state could not be read or written
    #[error("storage error: {0}")]
    Storage(String),

    /// The peer closed the connection
    #[error("connection has been closed")]
    Closed,

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl Error {
    /// Create a connection error from any displayable type.
    pub fn connection(msg: impl std::fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create an authentication error from any displayable type.
    pub fn auth(msg: impl std::fmt::Display) -> Self {
        Self::Authentication(msg.to_string())
    }

    /// Create a resumption error from any displayable type.
    pub fn resumption(msg: impl std::fmt::Display) -> Self {
        Self::Resumption(msg.to_string())
    }

    /// Create a storage error from any displayable type.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a crypto error from any displayable type.
    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Whether the caller may simply try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Whether the channel must be treated as unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Authentication(_))
    }

    /// Whether this error marks a graceful end of the session.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::connection("refused").is_retryable());
        assert!(Error::timeout("read").is_retryable());
        assert!(!Error::auth("bad signature").is_retryable());
        assert!(!Error::Closed.is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::protocol("unexpected route").is_fatal());
        assert!(Error::auth("bad mac").is_fatal());
        assert!(!Error::resumption("no session").is_fatal());
        assert!(!Error::storage("disk full").is_fatal());
        assert!(Error::Closed.is_closed());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("pipe"));
    }
}
