//! Policy Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A policy error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for policy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a policy list could not be built or loaded.
///
/// Apart from [`Storage`](Self::Storage), every variant means the persisted
/// list needs fixing by a human; running again will not help.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Two deny rules share a key.
    #[display("duplicate deny rule: {_0}")]
    Duplicate(#[error(not(source))] String),
    /// A package has both a package-wide rule and version-scoped rules.
    #[display("conflicting deny rules for {package}: package-wide rule and version rules for {versions}")]
    ConflictingScope { package: String, versions: String },
    /// A persisted deny rule is filed under the wrong key.
    #[display("deny rule filed under {key} belongs under {expected}")]
    KeyMismatch { key: String, expected: String },
    /// A persisted list is not valid JSON of the expected shape.
    #[display("malformed policy list {_0}")]
    Malformed(#[error(not(source))] String),
    /// The list could not be read from storage.
    #[display("could not read policy list {_0}")]
    Storage(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
