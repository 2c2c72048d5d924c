//! Error types for the Reflex protocol engine.

use thiserror::Error;

/// Result type alias for Reflex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving Reflex connections.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed (AEAD open, key derivation)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Authentication failed (unknown user UUID)
    #[error("authentication failed")]
    Authentication,

    /// Handshake protocol error
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Frame carried a type byte outside the known set
    #[error("invalid frame type: 0x{0:02x}")]
    InvalidFrameType(u8),

    /// Encrypted frame would exceed the 16-bit length prefix
    #[error("encrypted frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Session keys must be exactly 32 bytes
    #[error("session key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Malformed wire data (truncated destination, bad header)
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Connection or dial timeout
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A non-Reflex connection arrived but no cover server is configured
    #[error("no fallback configured")]
    NoFallback,

    /// The upstream dispatcher could not provide a link
    #[error("failed to dispatch to upstream: {0}")]
    Dispatch(String),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new malformed-message error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Create a new dispatch error
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Error::Dispatch(msg.into())
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication)
    }

    /// Check if this error came from ordinary peer I/O (close silently)
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }
}
