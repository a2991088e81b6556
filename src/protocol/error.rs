//! Protocol error types.

use thiserror::Error;

/// Errors related to decoding wire structures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidPacketType(u8),

    #[error("message too short: expected at least {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("message size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("message too long: max {max}, got {got}")]
    MessageTooLong { max: usize, got: usize },

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("prefix length {0} leaves no host bits")]
    InvalidPrefixLength(u8),

    #[error("malformed message: {0}")]
    Malformed(String),
}
