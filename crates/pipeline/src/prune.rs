//! Deny-list enforcement over already-indexed objects.
//!
//! The scan queues one [`PruneTask`] per object under a deny rule's prefix;
//! a separate worker [deletes](delete) them.

use crate::error::{ErrorKind, Result};
use crate::layout::rule_prefix;
use crate::worker::Verdict;
use async_trait::async_trait;
use exn::ResultExt;
use futures::TryStreamExt;
use regmirror_policy::DenyList;
use regmirror_queue::QueueHandle;
use regmirror_storage::BackendHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneTask {
    pub object_key: String,
}

/// Told when a prune scan queued anything.
#[async_trait]
pub trait ChangeHook: Send + Sync {
    async fn changed(&self, queued: usize) -> Result<()>;
}

/// Publish a notice to a queue, e.g. one that triggers a catalog rebuild.
pub struct QueueHook {
    queue: QueueHandle,
}
impl QueueHook {
    pub fn new(queue: QueueHandle) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ChangeHook for QueueHook {
    async fn changed(&self, queued: usize) -> Result<()> {
        let body = json!({"reason": "deny-list-prune", "queued": queued}).to_string();
        self.queue.publish(&body).await.or_raise(|| ErrorKind::Queue(self.queue.name().to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub rules: usize,
    pub queued: usize,
    /// Listing entries without a key.
    pub skipped: usize,
    pub notified: bool,
}

pub struct Pruner {
    backend: BackendHandle,
    queue: QueueHandle,
    data_prefix: String,
    hook: Option<Arc<dyn ChangeHook>>,
}

impl Pruner {
    pub fn new(backend: BackendHandle, queue: QueueHandle, data_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            queue,
            data_prefix: data_prefix.into(),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ChangeHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Queue every object covered by a deny rule for deletion, one rule at a
    /// time.
    pub async fn run(&self, deny_list: &DenyList) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        for rule in deny_list.rules() {
            report.rules += 1;
            let prefix = rule_prefix(&self.data_prefix, rule);
            let mut objects = self.backend.list_stream(&prefix);
            let mut queued = 0usize;
            while let Some(info) = objects.try_next().await.or_raise(|| ErrorKind::Storage(prefix.clone()))? {
                if info.key.is_empty() {
                    report.skipped += 1;
                    continue;
                }
                let task = PruneTask { object_key: info.key };
                let body = serde_json::to_string(&task).or_raise(|| ErrorKind::Encode("prune task".to_string()))?;
                self.queue.publish(&body).await.or_raise(|| ErrorKind::Queue(self.queue.name().to_string()))?;
                queued += 1;
            }
            if queued > 0 {
                tracing::info!(rule = %rule.key(), prefix = %prefix, queued, "Queued deny-listed objects for deletion");
            }
            report.queued += queued;
        }
        if report.queued > 0
            && let Some(hook) = &self.hook
        {
            hook.changed(report.queued).await?;
            report.notified = true;
        }
        Ok(report)
    }
}

/// Handle one prune-queue message. Deleting an object that is already gone
/// counts as done.
pub async fn delete(backend: &BackendHandle, body: &str) -> Verdict {
    let task = match serde_json::from_str::<PruneTask>(body) {
        Ok(task) if !task.object_key.is_empty() => task,
        _ => {
            tracing::error!(body, "Discarding malformed prune task");
            return Verdict::Discard;
        },
    };
    match backend.delete(&task.object_key).await {
        Ok(()) => {
            tracing::info!(key = %task.object_key, "Deleted deny-listed object");
            Verdict::Done
        },
        Err(err) if err.is_retryable() => {
            tracing::warn!(key = %task.object_key, error = ?err, "Delete failed, will retry");
            Verdict::Retry
        },
        Err(err) => {
            tracing::error!(key = %task.object_key, error = ?err, "Delete failed permanently");
            Verdict::Discard
        },
    }
}
