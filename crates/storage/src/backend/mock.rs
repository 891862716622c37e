//! In-memory storage for tests in every crate.

use crate::StorageBackend;
use crate::backend::paginate;
use crate::error::{ErrorKind, Result};
use crate::key::{validate as validate_key, validate_prefix};
use crate::models::{ListPage, Metadata, Object, ObjectInfo};
use async_trait::async_trait;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;

const DEFAULT_PAGE_SIZE: usize = 1000;

struct Entry {
    modified: OffsetDateTime,
    metadata: Metadata,
    data: Vec<u8>,
}
impl Entry {
    fn info(&self, key: &str) -> ObjectInfo {
        ObjectInfo::new(key, self.data.len() as u64, self.modified).with_etag(blake3::hash(&self.data).to_string())
    }
}

/// A [`StorageBackend`] over a `BTreeMap` behind a [`RwLock`]. Listings come
/// out in key order and page size is adjustable.
///
/// # Examples
///
/// ```
/// use regmirror_storage::backend::{MockBackend, StorageBackend};
/// use regmirror_storage::Metadata;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_objects([
///     ("data/foo/v1.0.0/package.json", b"{}"),
/// ]);
/// assert!(backend.exists("data/foo/v1.0.0/package.json").await?);
///
/// backend.write("staged/foo-1.0.0.tgz", b"data...", &Metadata::new()).await?;
/// assert!(backend.exists("staged/foo-1.0.0.tgz").await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    page_size: usize,
    storage: RwLock<BTreeMap<String, Entry>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with objects (without metadata).
    ///
    /// Panics on an invalid key.
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = BTreeMap::new();
        let now = OffsetDateTime::now_utc();
        for (key, data) in objects {
            let key = key.into();
            let Ok(validated) = validate_key(&key) else {
                panic!("MockBackend::with_objects: invalid key {key}");
            };
            let entry = Entry {
                modified: now,
                metadata: Metadata::new(),
                data: data.into(),
            };
            map.insert(validated, entry);
        }
        Self {
            name: "mock".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            storage: RwLock::new(map),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Shrink listing pages so tests can exercise continuation tokens.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Snapshot of every key currently stored, in order.
    pub async fn keys(&self) -> Vec<String> {
        self.storage.read().await.keys().cloned().collect()
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let objects: [(&str, &str); 0] = [];
        Self::with_objects(objects)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn uri(&self, key: &str) -> String {
        format!("mock://{}/{}", self.name, key)
    }

    async fn list_page(&self, prefix: &str, delimited: bool, continuation: Option<&str>) -> Result<ListPage> {
        let prefix = validate_prefix(prefix)?;
        // Snapshot under the read lock, then drop it before paginating.
        let infos: Vec<ObjectInfo> = {
            let guard = self.storage.read().await;
            guard.range(prefix.clone()..).take_while(|(key, _)| key.starts_with(&prefix)).map(|(k, e)| e.info(k)).collect()
        };
        Ok(paginate(&infos, &prefix, delimited, continuation, self.page_size))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = validate_key(key)?;
        Ok(self.storage.read().await.contains_key(&key))
    }

    async fn read_object(&self, key: &str) -> Result<Object> {
        let key = validate_key(key)?;
        let guard = self.storage.read().await;
        let entry = guard.get(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        Ok(Object {
            info: entry.info(&key),
            metadata: entry.metadata.clone(),
            data: entry.data.clone(),
        })
    }

    async fn write(&self, key: &str, data: &[u8], metadata: &Metadata) -> Result<()> {
        let key = validate_key(key)?;
        let entry = Entry {
            modified: OffsetDateTime::now_utc(),
            metadata: metadata.clone(),
            data: data.to_vec(),
        };
        self.storage.write().await.insert(key, entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = validate_key(key)?;
        self.storage.write().await.remove(&key);
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo> {
        let key = validate_key(key)?;
        let guard = self.storage.read().await;
        let entry = guard.get(&key).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.clone())))?;
        Ok(entry.info(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read_with_metadata() {
        let backend = MockBackend::default();
        let metadata = Metadata::from([("sequence".to_string(), "7".to_string())]);
        backend.write("test.txt", b"hello", &metadata).await.unwrap();
        let object = backend.read_object("test.txt").await.unwrap();
        assert_eq!(object.data, b"hello");
        assert_eq!(object.metadata, metadata);
        assert_eq!(object.info.size, 5);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_metadata() {
        let backend = MockBackend::default();
        let first = Metadata::from([("a".to_string(), "1".to_string())]);
        backend.write("k", b"one", &first).await.unwrap();
        backend.write("k", b"two", &Metadata::new()).await.unwrap();
        let object = backend.read_object("k").await.unwrap();
        assert_eq!(object.data, b"two");
        assert!(object.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let backend = MockBackend::default();
        let err = backend.read("missing.txt").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert_eq!(backend.try_read("missing.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MockBackend::default();
        backend.write("file.txt", b"data", &Metadata::new()).await.unwrap();
        backend.delete("file.txt").await.unwrap();
        assert!(!backend.exists("file.txt").await.unwrap());
        backend.delete("file.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_stream_follows_continuation() {
        let backend = MockBackend::with_objects((0..7).map(|i| (format!("k/{i}"), Vec::from(*b"x")))).with_page_size(2);
        let objects = backend.list("k/").await.unwrap();
        let keys: Vec<_> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["k/0", "k/1", "k/2", "k/3", "k/4", "k/5", "k/6"]);
    }

    #[tokio::test]
    async fn test_list_prefixes_across_pages() {
        let backend = MockBackend::with_objects([
            ("data/@scope/a/v1/package.json", Vec::from(*b"1")),
            ("data/@scope/b/v1/package.json", Vec::from(*b"2")),
            ("data/foo/v1/package.json", Vec::from(*b"3")),
            ("data/foo/v2/package.json", Vec::from(*b"4")),
            ("data/zed/v1/package.json", Vec::from(*b"5")),
        ])
        .with_page_size(1);
        let prefixes = backend.list_prefixes("data/").await.unwrap();
        assert_eq!(prefixes, vec!["data/@scope/", "data/foo/", "data/zed/"]);
        let versions = backend.list_prefixes("data/foo/").await.unwrap();
        assert_eq!(versions, vec!["data/foo/v1/", "data/foo/v2/"]);
    }

    #[tokio::test]
    async fn test_key_traversal_rejected() {
        let backend = MockBackend::default();
        assert!(backend.read("../etc/passwd").await.is_err());
        assert!(backend.write("../escape", b"bad", &Metadata::new()).await.is_err());
    }

    #[test]
    #[should_panic(expected = "invalid key")]
    fn test_with_objects_panics_on_bad_key() {
        MockBackend::with_objects([("../escape", Vec::from(*b"bad"))]);
    }
}
