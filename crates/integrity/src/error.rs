//! Integrity Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// An integrity error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for integrity operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The integrity string could not be parsed.
    #[display("malformed integrity string: {_0}")]
    Malformed(#[error(not(source))] String),
    /// Content does not match its digest.
    #[display("integrity mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
    /// The payload could not be serialized for digesting.
    #[display("payload could not be encoded")]
    Encode,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// A mismatch usually means a truncated or corrupted transfer, so fetching
    /// again is worth a try.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }
}
