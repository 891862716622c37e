//! Pipeline Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Staging has its own, finer-grained
//! [error kinds](crate::stage::error::ErrorKind) because its callers need to
//! tell permanent failures from transient ones.

use derive_more::{Display, Error};

/// A pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies the origin of a pipeline failure.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A storage backend operation failed.
    #[display("storage operation failed: {_0}")]
    Storage(#[error(not(source))] String),
    /// Publishing to or consuming from a queue failed.
    #[display("queue operation failed: {_0}")]
    Queue(#[error(not(source))] String),
    /// The upstream change feed could not be read.
    #[display("change feed unavailable")]
    Feed,
    /// A policy list could not be loaded.
    #[display("policy could not be loaded")]
    Policy,
    /// The persisted cursor is unreadable. Fatal: the run must not continue
    /// (and must not overwrite it).
    #[display("cursor at {_0} is corrupt")]
    CorruptCursor(#[error(not(source))] String),
    /// Staging a version failed.
    #[display("staging failed")]
    Stage,
    /// A value could not be serialized.
    #[display("could not encode {_0}")]
    Encode(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Queue(_) | Self::Feed | Self::Stage)
    }
}
