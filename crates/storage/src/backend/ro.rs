//! Read-only storage backend.
//!
//! This module provides a storage backend implementation that wraps other
//! implementations and prevents mutating operations from executing, while
//! still indicating success on return. Used for dry runs.

use async_trait::async_trait;

use crate::{
    BackendHandle, StorageBackend,
    backend::ObjectInfoStream,
    error::Result,
    models::{ListPage, Metadata, Object, ObjectInfo},
};

/// Read-only storage backend.
///
/// Wraps another backend and silently drops all writes and deletes, logging an
/// [`info event`](tracing::Event) for each.
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn uri(&self, key: &str) -> String {
        self.inner.uri(key)
    }

    async fn list_page(&self, prefix: &str, delimited: bool, continuation: Option<&str>) -> Result<ListPage> {
        self.inner.list_page(prefix, delimited, continuation).await
    }

    fn list_stream<'a>(&'a self, prefix: &'a str) -> ObjectInfoStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn read_object(&self, key: &str) -> Result<Object> {
        self.inner.read_object(key).await
    }

    async fn write(&self, key: &str, data: &[u8], _metadata: &Metadata) -> Result<()> {
        tracing::info!(backend = self.inner.name(), key, bytes = data.len(), "Skipping write during read-only mode");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tracing::info!(backend = self.inner.name(), key, "Skipping delete during read-only mode");
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo> {
        self.inner.stat(key).await
    }
}
