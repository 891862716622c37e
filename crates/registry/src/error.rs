//! Registry Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A registry error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The HTTP client could not be constructed.
    #[display("HTTP client could not be built")]
    Client,
    /// The request never produced a response (DNS, connect, timeout, reset).
    #[display("request to {_0} failed")]
    Transport(#[error(not(source))] String),
    /// The server answered with a non-2xx status.
    #[display("{url} responded with HTTP {status}")]
    Status { status: u16, url: String },
    /// The response body was not what the protocol promises.
    #[display("unexpected response body from {_0}")]
    Decode(#[error(not(source))] String),
    /// A package document is malformed and can never be processed.
    #[display("unprocessable document: {_0}")]
    Unprocessable(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::Transport("https://registry".to_string()).is_retryable());
        assert!(
            ErrorKind::Status {
                status: 404,
                url: "https://registry/foo.tgz".to_string()
            }
            .is_retryable()
        );
        assert!(!ErrorKind::Unprocessable("missing versions".to_string()).is_retryable());
        assert!(!ErrorKind::Decode("https://registry".to_string()).is_retryable());
    }
}
