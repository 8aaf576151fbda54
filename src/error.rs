use thiserror::Error;

use crate::handshake::ProtocolVersion;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer speaks a different protocol version
    #[error("version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },

    /// Key exchange failed (malformed key material, decrypt failure)
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// Protocol error (malformed frame, malformed varint, etc.)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Declared payload length exceeds the configured limit
    #[error("payload too large: {0} bytes (max {1})")]
    PayloadTooLarge(usize, usize),

    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
