//! Queue draining.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::{StreamExt, TryStreamExt, stream};
use regmirror_config::WorkerConfig;
use regmirror_queue::{Delivery, Disposition, QueueHandle};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;

/// What a handler decided about one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Handled; acknowledge.
    Done,
    /// Failed in a way that may pass next time; return it to the queue.
    Retry,
    /// Can never succeed; acknowledge and drop.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Done,
    Requeued,
    DeadLettered,
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub received: usize,
    pub done: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub discarded: usize,
}

/// Receive and handle messages until the queue comes back empty, running up
/// to `config.concurrency` handlers at once.
///
/// Each message is handled at most once per drain. A retried message waits
/// out the queue's visibility timeout and is picked up by a later drain. The
/// drain also stops when a receive only returns messages it has already
/// handled, which is what a read-only (dry-run) queue does. Queue errors
/// abort the drain; whatever was in flight is redelivered later.
pub async fn drain<F, Fut>(queue: &QueueHandle, config: &WorkerConfig, handler: F) -> Result<WorkerReport>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Verdict>,
{
    let mut report = WorkerReport::default();
    let mut handled = HashSet::new();
    loop {
        let deliveries =
            queue.receive(config.receive_batch).await.or_raise(|| ErrorKind::Queue(queue.name().to_string()))?;
        let received = deliveries.len();
        let deliveries: Vec<Delivery> =
            deliveries.into_iter().filter(|delivery| handled.insert(delivery.id.clone())).collect();
        if deliveries.is_empty() {
            if received > 0 {
                tracing::debug!(queue = queue.name(), received, "Only redelivered messages left; stopping");
            }
            break;
        }
        report.received += deliveries.len();
        let settled: Vec<Settled> = stream::iter(deliveries)
            .map(|delivery| {
                let verdict = handler(delivery.body.clone());
                async move { settle(queue, &delivery, verdict.await).await }
            })
            .buffer_unordered(config.concurrency.max(1))
            .try_collect()
            .await?;
        for outcome in settled {
            match outcome {
                Settled::Done => report.done += 1,
                Settled::Requeued => report.retried += 1,
                Settled::DeadLettered => report.dead_lettered += 1,
                Settled::Discarded => report.discarded += 1,
            }
        }
    }
    tracing::info!(queue = queue.name(), received = report.received, done = report.done, "Queue drained");
    Ok(report)
}

async fn settle(queue: &QueueHandle, delivery: &Delivery, verdict: Verdict) -> Result<Settled> {
    let failed = || ErrorKind::Queue(queue.name().to_string());
    match verdict {
        Verdict::Done => {
            queue.ack(delivery).await.or_raise(failed)?;
            Ok(Settled::Done)
        },
        Verdict::Discard => {
            queue.ack(delivery).await.or_raise(failed)?;
            Ok(Settled::Discarded)
        },
        Verdict::Retry => match queue.nack(delivery).await.or_raise(failed)? {
            Disposition::Requeued => Ok(Settled::Requeued),
            Disposition::DeadLettered => {
                tracing::warn!(queue = queue.name(), message = %delivery.id, receives = delivery.receive_count, "Message dead-lettered");
                Ok(Settled::DeadLettered)
            },
        },
    }
}
