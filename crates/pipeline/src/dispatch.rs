//! Handing accepted versions from the follower to the stager.

use crate::error::{ErrorKind, Result};
use crate::stage::{Outcome, StageRequest, Stager};
use async_trait::async_trait;
use exn::ResultExt;
use regmirror_queue::QueueHandle;

#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: &StageRequest) -> Result<()>;
}

/// Publish stage requests to the staging queue for the stage worker.
pub struct QueueDispatch {
    queue: QueueHandle,
}
impl QueueDispatch {
    pub fn new(queue: QueueHandle) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Dispatch for QueueDispatch {
    async fn dispatch(&self, request: &StageRequest) -> Result<()> {
        let body = serde_json::to_string(request).or_raise(|| ErrorKind::Encode("stage request".to_string()))?;
        let id = self.queue.publish(&body).await.or_raise(|| ErrorKind::Queue(self.queue.name().to_string()))?;
        tracing::debug!(package = %request.name, version = %request.version, message = %id, "Queued stage request");
        Ok(())
    }
}

/// Stage in-process, one version at a time.
#[async_trait]
impl Dispatch for Stager {
    async fn dispatch(&self, request: &StageRequest) -> Result<()> {
        match self.stage(request).await.or_raise(|| ErrorKind::Stage)? {
            Outcome::Staged { .. } | Outcome::Denied { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmirror_queue::MemoryQueue;
    use std::sync::Arc;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_queue_dispatch() {
        let queue = Arc::new(MemoryQueue::new("staging"));
        let request = StageRequest {
            name: "foo".to_string(),
            version: "1.0.0".to_string(),
            tarball_url: "https://registry.example/foo-1.0.0.tgz".to_string(),
            integrity: None,
            modified: datetime!(2024-01-01 00:00:00 UTC),
            sequence: 7,
            frameworks: vec![],
        };
        QueueDispatch::new(queue.clone()).dispatch(&request).await.unwrap();

        let published = queue.published().await;
        assert_eq!(published.len(), 1);
        let decoded: StageRequest = serde_json::from_str(&published[0]).unwrap();
        assert_eq!(decoded, request);
        assert!(!published[0].contains("frameworks"));
    }
}
