//! Storage models.
//!
//! These types describe objects held by a storage backend: listing entries,
//! full objects with their user metadata, and single pages of a listing.

use std::collections::BTreeMap;
use time::OffsetDateTime;

/// User metadata attached to an object.
///
/// Keys should be lowercase kebab-case: S3-compatible services lowercase
/// them on write, so anything else will not survive a round trip.
pub type Metadata = BTreeMap<String, String>;

/// Object metadata returned by listing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the backend root. May be empty when a remote listing
    /// returned an entry without a key; callers should skip those.
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
    /// Backend-specific content tag (S3 ETag, BLAKE3 for local backends)
    pub etag: Option<String>,
}
impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            key: key.into(),
            size,
            modified,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// A complete object: contents plus user metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub info: ObjectInfo,
    pub metadata: Metadata,
    pub data: Vec<u8>,
}

/// One page of a listing.
///
/// When the listing was delimited, keys that continue past the next `/`
/// after the prefix are rolled up into `prefixes` (each ending in `/`)
/// instead of appearing in `objects`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
    /// Opaque token to pass back for the next page; `None` on the last page.
    pub continuation: Option<String>,
}
