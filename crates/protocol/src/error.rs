//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering malformed channel request payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload ended before a fixed-size field could be read.
    #[error("truncated payload: {field} needs {needed} bytes, {available} available")]
    Truncated {
        /// Name of the field being decoded.
        field: &'static str,
        /// Number of bytes the field requires.
        needed: usize,
        /// Number of bytes left in the payload.
        available: usize,
    },

    /// A length prefix points past the end of the payload.
    #[error("length out of range: {field} declares {declared} bytes, {available} available")]
    LengthOutOfRange {
        /// Name of the field being decoded.
        field: &'static str,
        /// Length declared by the prefix.
        declared: u32,
        /// Number of bytes left after the prefix.
        available: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("invalid utf-8 in {field}")]
    InvalidUtf8 {
        /// Name of the field being decoded.
        field: &'static str,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
