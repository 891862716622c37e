//! Objects as plain files under a root directory. User metadata lives in
//! JSON sidecars under a reserved directory at the root.

use crate::backend::paginate;
use crate::error::ErrorKind;
use crate::key::{validate as validate_key, validate_prefix};
use crate::models::{ListPage, Metadata, Object, ObjectInfo};
use crate::{StorageBackend, error::Result};
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata as FsMetadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;

/// Reserved root directory holding metadata sidecars. Never listed.
const META_DIR: &str = ".regmirror-meta";
/// Suffix of in-progress writes. Never listed.
const TMP_SUFFIX: &str = ".regmirror-tmp";
const PAGE_SIZE: usize = 1000;

/// Filesystem-backed storage for single-host mirrors and tests.
///
/// # Limitations
/// A key cannot be both an object and a "directory" of other keys (`a` and
/// `a/b`), which S3 allows.
///
/// # Examples
///
/// ```no_run
/// use regmirror_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/var/lib/regmirror")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for the store
    root: PathBuf,
}
impl LocalBackend {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidKey(root.display().to_string()));
        }

        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidKey(root.display().to_string()));
            }
        } else {
            // Blocking is fine, this runs once at startup.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root.display().to_string()))?;
        }

        Ok(Self { name: name.into(), root })
    }

    /// Get the absolute path for an object key.
    fn absolute_path(&self, key: &str) -> Result<(String, PathBuf)> {
        let key = validate_key(key)?;
        if key == META_DIR || key.starts_with(&format!("{META_DIR}/")) || key.ends_with(TMP_SUFFIX) {
            exn::bail!(ErrorKind::InvalidKey(key));
        }
        let path = self.root.join(&key);
        Ok((key, path))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn info(key: &str, metadata: &FsMetadata) -> Result<ObjectInfo> {
        let modified: OffsetDateTime = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(ObjectInfo::new(key, metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, key: &str) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(key.to_string()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(key.to_string()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Write to a temporary sibling then rename over the target, so readers
    /// never observe a half-written object.
    async fn write_atomic(path: &Path, data: &[u8], key: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, key))?;
        }
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let tmp = path.with_file_name(format!(
            "{}.{nanos}{TMP_SUFFIX}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));
        fs::write(&tmp, data).await.map_err(|e| Self::map_io_error(e, key))?;
        if let Err(e) = fs::rename(&tmp, path).await {
            _ = fs::remove_file(&tmp).await;
            exn::bail!(Self::map_io_error(e, key));
        }
        Ok(())
    }

    /// Walk every object below the directory that contains `prefix`.
    ///
    /// Keys are compared byte-wise against the prefix afterwards, so the
    /// prefix `data/fo` walks `data/` and matches `data/foo/...`.
    async fn walk(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let start = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        let mut stack = vec![start];
        let mut found = Vec::new();
        while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                // A missing directory lists as empty, like S3.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => exn::bail!(Self::map_io_error(err, &current.display().to_string())),
            };
            while let Some(entry) = entries.next_entry().await.map_err(ErrorKind::Io)? {
                let path = entry.path();
                let relative = path.strip_prefix(&self.root).or_raise(|| {
                    ErrorKind::BackendError(format!("path `{}` is not within root", path.display()))
                })?;
                // Keys always use forward slashes, whatever the platform does.
                let key = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
                if key == META_DIR || key.ends_with(TMP_SUFFIX) {
                    continue;
                }
                let metadata = entry.metadata().await.map_err(|e| Self::map_io_error(e, &key))?;
                if metadata.is_dir() {
                    stack.push(path);
                } else if metadata.is_file() && key.starts_with(prefix) {
                    found.push(Self::info(&key, &metadata)?);
                }
                // Broken symlink.
            }
        }
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }

    async fn list_page(&self, prefix: &str, delimited: bool, continuation: Option<&str>) -> Result<ListPage> {
        let prefix = validate_prefix(prefix)?;
        let objects = self.walk(&prefix).await?;
        Ok(paginate(&objects, &prefix, delimited, continuation, PAGE_SIZE))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let (_, path) = self.absolute_path(key)?;
        Ok(fs::try_exists(&path).await.map_err(ErrorKind::Io)?)
    }

    async fn read_object(&self, key: &str) -> Result<Object> {
        let (key, path) = self.absolute_path(key)?;
        let data = fs::read(&path).await.map_err(|e| Self::map_io_error(e, &key))?;
        let fs_metadata = fs::metadata(&path).await.map_err(|e| Self::map_io_error(e, &key))?;
        let metadata = match fs::read(self.metadata_path(&key)).await {
            Ok(raw) => serde_json::from_slice(&raw).or_raise(|| ErrorKind::InvalidMetadata(key.clone()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Metadata::new(),
            Err(e) => exn::bail!(Self::map_io_error(e, &key)),
        };
        let info = Self::info(&key, &fs_metadata)?.with_etag(blake3::hash(&data).to_string());
        Ok(Object { info, metadata, data })
    }

    async fn write(&self, key: &str, data: &[u8], metadata: &Metadata) -> Result<()> {
        let (key, path) = self.absolute_path(key)?;
        let meta_path = self.metadata_path(&key);
        if metadata.is_empty() {
            match fs::remove_file(&meta_path).await {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => exn::bail!(Self::map_io_error(e, &key)),
            }
        } else {
            let encoded = serde_json::to_vec(metadata).or_raise(|| ErrorKind::InvalidMetadata(key.clone()))?;
            Self::write_atomic(&meta_path, &encoded, &key).await?;
        }
        Self::write_atomic(&path, data, &key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let (key, path) = self.absolute_path(key)?;
        for target in [path, self.metadata_path(&key)] {
            match fs::remove_file(&target).await {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => exn::bail!(Self::map_io_error(e, &key)),
            }
        }
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo> {
        let (key, path) = self.absolute_path(key)?;
        let metadata = fs::metadata(&path).await.map_err(|e| Self::map_io_error(e, &key))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::NotFound(key));
        }
        Self::info(&key, &metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
        assert!(LocalBackend::new("name", "./relative").is_err());
    }

    #[tokio::test]
    async fn test_write_and_read_with_metadata() {
        let (_dir, backend) = backend();
        let metadata = Metadata::from([("source-url".to_string(), "https://host/foo-1.0.0.tgz".to_string())]);
        backend.write("staged/foo-1.0.0.tgz", b"tarball", &metadata).await.unwrap();
        let object = backend.read_object("staged/foo-1.0.0.tgz").await.unwrap();
        assert_eq!(object.data, b"tarball");
        assert_eq!(object.metadata, metadata);
        assert_eq!(object.info.etag, Some(blake3::hash(b"tarball").to_string()));
    }

    #[tokio::test]
    async fn test_metadata_is_never_listed() {
        let (_dir, backend) = backend();
        let metadata = Metadata::from([("a".to_string(), "b".to_string())]);
        backend.write("one", b"1", &metadata).await.unwrap();
        backend.write("dir/two", b"2", &metadata).await.unwrap();
        let keys: Vec<_> = backend.list("").await.unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["dir/two", "one"]);
        assert!(backend.read(&format!("{META_DIR}/one.json")).await.is_err());
    }

    #[tokio::test]
    async fn test_byte_wise_prefix() {
        let (_dir, backend) = backend();
        backend.write("data/foo/v1/package.json", b"1", &Metadata::new()).await.unwrap();
        backend.write("data/foobar/v1/package.json", b"2", &Metadata::new()).await.unwrap();
        backend.write("data/bar/v1/package.json", b"3", &Metadata::new()).await.unwrap();
        assert_eq!(backend.list("data/foo").await.unwrap().len(), 2);
        assert_eq!(backend.list("data/foo/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_prefixes() {
        let (_dir, backend) = backend();
        backend.write("data/@scope/a/v1.0.0/package.json", b"1", &Metadata::new()).await.unwrap();
        backend.write("data/foo/v1.0.0/package.json", b"2", &Metadata::new()).await.unwrap();
        assert_eq!(backend.list_prefixes("data/").await.unwrap(), vec!["data/@scope/", "data/foo/"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, backend) = backend();
        let metadata = Metadata::from([("a".to_string(), "b".to_string())]);
        backend.write("file.txt", b"data", &metadata).await.unwrap();
        backend.delete("file.txt").await.unwrap();
        assert!(!backend.exists("file.txt").await.unwrap());
        backend.delete("file.txt").await.unwrap();
        // A re-created object starts without the old metadata.
        backend.write("file.txt", b"data", &Metadata::new()).await.unwrap();
        assert!(backend.read_object("file.txt").await.unwrap().metadata.is_empty());
    }

    #[tokio::test]
    async fn test_list_nonexistent_prefix() {
        let (_dir, backend) = backend();
        assert!(backend.list("nonexistent/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stat_missing() {
        let (_dir, backend) = backend();
        let err = backend.stat("missing").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_key_security() {
        let (_dir, backend) = backend();
        // Attempts to escape the root should fail
        assert!(backend.read("../etc/passwd").await.is_err());
        assert!(backend.read("etc/../../passwd").await.is_err());
        assert!(backend.write("../etc/passwd", b"data", &Metadata::new()).await.is_err());
        assert!(backend.delete("../../file").await.is_err());
        assert!(backend.write(&format!("{META_DIR}/x.json"), b"{}", &Metadata::new()).await.is_err());
    }
}
