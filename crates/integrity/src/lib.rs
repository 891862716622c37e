//! Content digests and integrity envelopes.
//!
//! Digests use the [Subresource Integrity] string format (`sha512-<base64>`)
//! that package registries already publish in version manifests, so a
//! downloaded tarball can be checked against its upstream hint and our own
//! digests can be compared with theirs.
//!
//! [Subresource Integrity]: https://www.w3.org/TR/SRI/

mod envelope;
pub mod error;
mod sri;

pub use crate::envelope::Envelope;
pub use crate::sri::{Algorithm, Integrity, Verification, verify};
