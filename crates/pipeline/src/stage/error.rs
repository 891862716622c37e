//! Staging errors.
//!
//! The stage worker decides between retrying a request and dropping it by
//! [`ErrorKind::is_retryable`], so every variant states which one it is.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The tarball URL cannot be parsed, is not HTTP(S), or has no usable
    /// path. Permanent.
    #[display("invalid tarball URL: {_0}")]
    InvalidUrl(#[error(not(source))] String),
    /// The upstream integrity hint is not a valid integrity string. Permanent.
    #[display("invalid integrity hint for {_0}")]
    InvalidIntegrity(#[error(not(source))] String),
    /// Downloading the tarball failed.
    #[display("could not fetch {_0}")]
    Fetch(#[error(not(source))] String),
    /// The downloaded bytes do not match the integrity hint.
    #[display("integrity mismatch for {_0}")]
    Integrity(#[error(not(source))] String),
    #[display("could not write {_0}")]
    Storage(#[error(not(source))] String),
    #[display("could not publish to {_0}")]
    Queue(#[error(not(source))] String),
    #[display("could not encode notification")]
    Encode,
}

impl ErrorKind {
    /// Returns `true` if staging the same request again might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_) | Self::InvalidIntegrity(_) | Self::Encode)
    }
}
