//! Queue persisted in an object store.
//!
//! Each message is one object. Its state is encoded in the key:
//!
//! ```text
//! <root>/<name>/pending/<id>
//! <root>/<name>/inflight/<id>
//! <root>/<name>/dead/<id>
//! ```
//!
//! and its receive count travels in the object metadata. Moving a message
//! between states is a write followed by a delete, so a crash in between
//! can deliver a message twice but never loses one. An in-flight object's
//! modification time starts its visibility timeout; `receive` first returns
//! expired in-flight messages to `pending` (or `dead`).

use crate::error::{ErrorKind, Result};
use crate::{DEFAULT_MAX_RECEIVES, DEFAULT_VISIBILITY_TIMEOUT, Delivery, Disposition, Queue, message_id};
use async_trait::async_trait;
use exn::ResultExt;
use regmirror_storage::{BackendHandle, Metadata};
use std::time::Duration;
use time::OffsetDateTime;

const RECEIVE_COUNT: &str = "receive-count";

#[derive(Debug, Clone, Copy)]
enum Area {
    Pending,
    InFlight,
    Dead,
}
impl Area {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "inflight",
            Self::Dead => "dead",
        }
    }
}

/// A [`Queue`] stored in a [`StorageBackend`](regmirror_storage::StorageBackend).
///
/// Lets independent processes (a follower and a stage worker, say) share a
/// queue without any broker beyond the object store they already use.
pub struct StoreQueue {
    name: String,
    backend: BackendHandle,
    root: String,
    max_receives: u32,
    visibility_timeout: Duration,
}

impl StoreQueue {
    pub fn new(backend: BackendHandle, root: impl AsRef<str>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend,
            root: root.as_ref().trim_matches('/').to_string(),
            max_receives: DEFAULT_MAX_RECEIVES,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    pub fn with_max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = max_receives.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn prefix(&self, area: Area) -> String {
        match self.root.is_empty() {
            true => format!("{}/{}/", self.name, area.as_str()),
            false => format!("{}/{}/{}/", self.root, self.name, area.as_str()),
        }
    }

    fn key(&self, area: Area, id: &str) -> String {
        format!("{}{id}", self.prefix(area))
    }

    fn metadata(receive_count: u32) -> Metadata {
        Metadata::from([(RECEIVE_COUNT.to_string(), receive_count.to_string())])
    }

    /// Move a message between areas, rewriting its receive count on the way.
    /// Returns `None` if the message is no longer in the `from` area.
    async fn move_message(
        &self,
        id: &str,
        from: Area,
        to: Area,
        receive_count: impl FnOnce(u32) -> u32 + Send,
    ) -> Result<Option<Delivery>> {
        let from_key = self.key(from, id);
        let Some(object) = (match self.backend.read_object(&from_key).await {
            Ok(object) => Some(object),
            Err(e) if matches!(&*e, regmirror_storage::error::ErrorKind::NotFound(_)) => None,
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage(from_key)),
        }) else {
            // Another consumer got there first.
            return Ok(None);
        };
        let body = String::from_utf8(object.data).or_raise(|| ErrorKind::Corrupt(id.to_string()))?;
        let count = receive_count(Self::receive_count(&object.metadata));
        let to_key = self.key(to, id);
        self.backend
            .write(&to_key, body.as_bytes(), &Self::metadata(count))
            .await
            .or_raise(|| ErrorKind::Storage(to_key.clone()))?;
        self.backend.delete(&from_key).await.or_raise(|| ErrorKind::Storage(from_key.clone()))?;
        Ok(Some(Delivery {
            id: id.to_string(),
            body,
            receive_count: count,
        }))
    }

    fn receive_count(metadata: &Metadata) -> u32 {
        metadata.get(RECEIVE_COUNT).and_then(|c| c.parse().ok()).unwrap_or(0)
    }

    fn id_of<'k>(&self, area: Area, key: &'k str) -> Option<&'k str> {
        let prefix = self.prefix(area);
        key.strip_prefix(prefix.as_str()).filter(|id| !id.is_empty() && !id.contains('/'))
    }

    /// Return expired in-flight messages to the queue (or the dead-letter
    /// area if they have used up their receives).
    async fn reclaim(&self) -> Result<()> {
        let prefix = self.prefix(Area::InFlight);
        let stale = self.backend.list(&prefix).await.or_raise(|| ErrorKind::Storage(prefix.clone()))?;
        let cutoff = OffsetDateTime::now_utc() - self.visibility_timeout;
        for info in stale.into_iter().filter(|info| info.modified < cutoff) {
            let Some(id) = self.id_of(Area::InFlight, &info.key) else {
                continue;
            };
            let key = self.key(Area::InFlight, id);
            let count = match self.backend.read_object(&key).await {
                Ok(object) => Self::receive_count(&object.metadata),
                Err(e) if matches!(&*e, regmirror_storage::error::ErrorKind::NotFound(_)) => continue,
                Err(e) => return Err(e).or_raise(|| ErrorKind::Storage(key)),
            };
            let area = match count >= self.max_receives {
                true => Area::Dead,
                false => Area::Pending,
            };
            if self.move_message(id, Area::InFlight, area, |c| c).await?.is_some() {
                tracing::debug!(queue = %self.name, id, area = area.as_str(), "Reclaimed expired in-flight message");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for StoreQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, body: &str) -> Result<String> {
        let id = message_id(body);
        let key = self.key(Area::Pending, &id);
        self.backend.write(&key, body.as_bytes(), &Self::metadata(0)).await.or_raise(|| ErrorKind::Storage(key))?;
        tracing::debug!(queue = %self.name, id, "Published message");
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        self.reclaim().await?;
        let prefix = self.prefix(Area::Pending);
        let page = self.backend.list_page(&prefix, false, None).await.or_raise(|| ErrorKind::Storage(prefix.clone()))?;
        let mut deliveries = Vec::new();
        for info in page.objects {
            if deliveries.len() >= max {
                break;
            }
            let Some(id) = self.id_of(Area::Pending, &info.key) else {
                continue;
            };
            if let Some(delivery) = self.move_message(id, Area::Pending, Area::InFlight, |c| c + 1).await? {
                deliveries.push(delivery);
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let key = self.key(Area::InFlight, &delivery.id);
        self.backend.delete(&key).await.or_raise(|| ErrorKind::Storage(key))
    }

    async fn nack(&self, delivery: &Delivery) -> Result<Disposition> {
        let key = self.key(Area::InFlight, &delivery.id);
        let object = match self.backend.read_object(&key).await {
            Ok(object) => object,
            Err(e) if matches!(&*e, regmirror_storage::error::ErrorKind::NotFound(_)) => {
                return Ok(Disposition::Requeued);
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage(key)),
        };
        let count = Self::receive_count(&object.metadata);
        if count >= self.max_receives {
            self.move_message(&delivery.id, Area::InFlight, Area::Dead, |c| c).await?;
            tracing::warn!(queue = %self.name, id = %delivery.id, receives = count, "Message moved to dead-letter area");
            Ok(Disposition::DeadLettered)
        } else {
            // Rewriting restarts the visibility timeout.
            self.backend.write(&key, &object.data, &object.metadata).await.or_raise(|| ErrorKind::Storage(key.clone()))?;
            Ok(Disposition::Requeued)
        }
    }

    async fn redrive(&self) -> Result<usize> {
        let prefix = self.prefix(Area::Dead);
        let dead = self.backend.list(&prefix).await.or_raise(|| ErrorKind::Storage(prefix.clone()))?;
        let mut moved = 0;
        for info in dead {
            let Some(id) = self.id_of(Area::Dead, &info.key) else {
                continue;
            };
            if self.move_message(id, Area::Dead, Area::Pending, |_| 0).await?.is_some() {
                moved += 1;
            }
        }
        tracing::info!(queue = %self.name, moved, "Redrove dead-lettered messages");
        Ok(moved)
    }
}
