//! Everything the mirror persists (staged tarballs, the cursor, queue
//! messages, catalogs) goes through [`StorageBackend`].

mod local;
#[cfg(feature = "mock")]
mod mock;
mod ro;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
pub use self::ro::ReadOnlyBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::{ErrorKind, Result};
use crate::models::{ListPage, Metadata, Object, ObjectInfo};
use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::ops::Deref;
use std::pin::Pin;

pub(crate) type ObjectInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectInfo>> + Send + 'a>>;

/// Flat key/value object store with per-object string metadata and
/// prefix listings.
///
/// # Key Handling
/// Keys are relative to the backend root. Implementations reject anything
/// [`validate_key`](crate::validate_key) rejects.
///
/// # Examples
///
/// ```
/// use regmirror_storage::{backend::StorageBackend, error::Result};
///
/// async fn size_of_cursor(backend: &dyn StorageBackend) -> Result<u64> {
///     match backend.try_read("cursor.json").await? {
///         Some(data) => Ok(data.len() as u64),
///         None => Ok(0),
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend. Used for logging only.
    fn name(&self) -> &str;

    /// A URI identifying `key` within this backend, for consumers outside
    /// this process (e.g. `s3://bucket/key`).
    fn uri(&self, key: &str) -> String;

    /// Fetch a single page of a listing.
    ///
    /// Lists objects whose keys start with `prefix` (byte-wise, not
    /// segment-wise), in ascending key order. When `delimited` is set, keys
    /// containing a `/` after the prefix are rolled up into
    /// [`ListPage::prefixes`].
    ///
    /// Pass the previous page's [`ListPage::continuation`] to get the next
    /// page.
    async fn list_page(&self, prefix: &str, delimited: bool, continuation: Option<&str>) -> Result<ListPage>;

    /// Stream every object under `prefix`, following continuation tokens
    /// until the listing is exhausted.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// # use regmirror_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    ///
    /// let mut stream = backend.list_stream("staged/");
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.key, info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: &'a str) -> ObjectInfoStream<'a> {
        Box::pin(stream! {
            let mut continuation: Option<String> = None;
            loop {
                let page = match self.list_page(prefix, false, continuation.as_deref()).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        break;
                    },
                };
                for object in page.objects {
                    yield Ok(object);
                }
                match page.continuation {
                    Some(next) => continuation = Some(next),
                    None => break,
                }
            }
        })
    }

    /// List all objects under a prefix.
    ///
    /// Collects [`list_stream()`](Self::list_stream).
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// List the immediate sub-prefixes of `prefix` (one level, delimited by
    /// `/`), following continuation tokens.
    ///
    /// Listing `"data/"` over the keys `data/foo/v1/a` and `data/@s/bar/v1/a`
    /// returns `["data/@s/", "data/foo/"]`.
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self.list_page(prefix, true, continuation.as_deref()).await?;
            prefixes.extend(page.prefixes);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(prefixes)
    }

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read an object's contents and metadata.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn read_object(&self, key: &str) -> Result<Object>;

    /// Read an object's contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.read_object(key).await?.data)
    }

    /// Read an object's contents, mapping a missing object to `None`.
    async fn try_read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read(key).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write an object, replacing any existing object (and its metadata)
    /// under the same key.
    ///
    /// # Notes
    /// - Implementations should create parent directories as needed.
    ///
    /// ```no_run
    /// # use regmirror_storage::{backend::StorageBackend, error::Result, Metadata};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let metadata = Metadata::from([("sequence".to_string(), "42".to_string())]);
    /// backend.write("staged/foo-1.0.0.tgz", b"...", &metadata).await?;
    /// # Ok(())
    /// # }
    /// ```
    async fn write(&self, key: &str, data: &[u8], metadata: &Metadata) -> Result<()>;

    /// Delete an object.
    ///
    /// Deleting an object that does not exist is **not** an error: deletes
    /// must be safe to repeat under at-least-once delivery.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Get object metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn stat(&self, key: &str) -> Result<ObjectInfo>;
}

pub(crate) fn is_not_found(err: &crate::error::Error) -> bool {
    matches!(err.deref(), ErrorKind::NotFound(_))
}

/// Page through an ordered set of entries the same way S3 does.
///
/// Backends that hold (or can cheaply compute) their complete key set share
/// this so that every backend agrees on delimiter and continuation semantics.
/// The continuation token is the last key or prefix emitted on the previous
/// page.
pub(crate) fn paginate<'e>(
    entries: impl IntoIterator<Item = &'e ObjectInfo>,
    prefix: &str,
    delimited: bool,
    continuation: Option<&str>,
    page_size: usize,
) -> ListPage {
    let mut page = ListPage::default();
    let mut emitted = 0usize;
    let mut last: Option<String> = None;
    for entry in entries {
        if !entry.key.starts_with(prefix) {
            continue;
        }
        if let Some(token) = continuation {
            // A rolled-up prefix token covers every key beneath it.
            if entry.key.as_str() <= token || (token.ends_with('/') && entry.key.starts_with(token)) {
                continue;
            }
        }
        let rolled_up = match delimited {
            true => entry.key[prefix.len()..].find('/').map(|idx| entry.key[..prefix.len() + idx + 1].to_string()),
            false => None,
        };
        if let Some(rolled) = &rolled_up
            && last.as_deref() == Some(rolled.as_str())
        {
            continue;
        }
        if emitted == page_size {
            page.continuation = last;
            return page;
        }
        emitted += 1;
        match rolled_up {
            Some(rolled) => {
                last = Some(rolled.clone());
                page.prefixes.push(rolled);
            },
            None => {
                last = Some(entry.key.clone());
                page.objects.push(entry.clone());
            },
        }
    }
    page
}
