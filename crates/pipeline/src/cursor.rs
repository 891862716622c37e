//! The follower's persisted position.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regmirror_storage::{BackendHandle, Metadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Where the follower is in the change feed, and which versions it has
/// already seen (with the modification time it saw them at).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub marker: u64,
    known_versions: BTreeMap<String, OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Stamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime);

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stored {
    marker: u64,
    #[serde(default)]
    known_versions: BTreeMap<String, Stamp>,
}

/// Every shape the cursor has been persisted in.
#[derive(Deserialize)]
#[serde(untagged)]
enum Versioned {
    Current(Stored),
    /// Just the marker.
    Legacy(u64),
}

impl Cursor {
    pub fn new(marker: u64) -> Self {
        Self {
            marker,
            known_versions: BTreeMap::new(),
        }
    }

    /// Whether `id` (`name@version`) modified at `modified` has not been
    /// seen yet, or was last seen at an older modification time.
    pub fn is_newer(&self, id: &str, modified: OffsetDateTime) -> bool {
        self.known_versions.get(id).is_none_or(|seen| modified > *seen)
    }

    /// Remember `id` as seen at `modified`. Never moves a stamp backwards.
    pub fn record(&mut self, id: impl Into<String>, modified: OffsetDateTime) {
        self.known_versions
            .entry(id.into())
            .and_modify(|seen| *seen = (*seen).max(modified))
            .or_insert(modified);
    }

    pub fn known_versions(&self) -> &BTreeMap<String, OffsetDateTime> {
        &self.known_versions
    }

    /// Decode a persisted cursor, in either its current or legacy form.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Versioned>(data).ok()? {
            Versioned::Current(stored) => Some(Self {
                marker: stored.marker,
                known_versions: stored.known_versions.into_iter().map(|(id, Stamp(at))| (id, at)).collect(),
            }),
            Versioned::Legacy(marker) => Some(Self::new(marker)),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let stored = Stored {
            marker: self.marker,
            known_versions: self.known_versions.iter().map(|(id, at)| (id.clone(), Stamp(*at))).collect(),
        };
        serde_json::to_vec(&stored).or_raise(|| ErrorKind::Encode("cursor".to_string()))
    }

    /// Load the cursor stored at `key`. A missing cursor is a fresh start; an
    /// unreadable one is fatal.
    pub async fn load(backend: &BackendHandle, key: &str) -> Result<Self> {
        let data = backend.try_read(key).await.or_raise(|| ErrorKind::Storage(key.to_string()))?;
        let Some(data) = data else {
            tracing::info!(key, "No cursor found, starting from the beginning");
            return Ok(Self::default());
        };
        match Self::from_json(&data) {
            Some(cursor) => Ok(cursor),
            None => exn::bail!(ErrorKind::CorruptCursor(key.to_string())),
        }
    }

    pub async fn save(&self, backend: &BackendHandle, key: &str) -> Result<()> {
        let data = self.to_json()?;
        let metadata = Metadata::from([("marker".to_string(), self.marker.to_string())]);
        backend.write(key, &data, &metadata).await.or_raise(|| ErrorKind::Storage(key.to_string()))?;
        tracing::debug!(key, marker = self.marker, known = self.known_versions.len(), "Saved cursor");
        Ok(())
    }
}
