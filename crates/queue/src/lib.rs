//! At-least-once message queues.
//!
//! Messages are opaque strings. A consumer [receives](Queue::receive) a batch
//! of [`Delivery`]s and must either [ack](Queue::ack) each one (done) or
//! [nack](Queue::nack) it (try again later). A received message stays
//! invisible until its visibility timeout expires, whether it was nacked or
//! its consumer died, so retries are spaced out. A message that has been
//! delivered `max_receives` times without being acked is moved to the
//! dead-letter area, from where an operator can [redrive](Queue::redrive) it.

pub mod error;
#[cfg(feature = "mock")]
mod memory;
mod store;

#[cfg(feature = "mock")]
pub use crate::memory::MemoryQueue;
pub use crate::store::StoreQueue;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

/// Receive count after which a nacked message is dead-lettered, unless
/// configured otherwise.
pub const DEFAULT_MAX_RECEIVES: u32 = 5;
/// How long a received message stays invisible to other receives.
pub const DEFAULT_VISIBILITY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15 * 60);

pub type QueueHandle = Arc<dyn Queue + Send + Sync>;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub body: String,
    /// How many times this message has been delivered, including this time.
    pub receive_count: u32,
}

/// What happened to a message after a [nack](Queue::nack).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Will be delivered again once its visibility timeout expires.
    Requeued,
    /// Delivered too many times; parked in the dead-letter area.
    DeadLettered,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Name of the queue. Used for logging only.
    fn name(&self) -> &str;

    /// Publish a message, returning its ID.
    async fn publish(&self, body: &str) -> Result<String>;

    /// Receive up to `max` messages, oldest first. An empty result means the
    /// queue is (currently) drained.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Acknowledge a delivery, removing the message for good. Acking a
    /// delivery twice is not an error.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Give up on a delivery for now. The message becomes receivable again
    /// after the visibility timeout, or is dead-lettered once it has reached
    /// the maximum receive count.
    async fn nack(&self, delivery: &Delivery) -> Result<Disposition>;

    /// Move every dead-lettered message back onto the live queue with a fresh
    /// receive count. Returns how many were moved.
    async fn redrive(&self) -> Result<usize>;
}

/// Generate a message ID that sorts by publish time.
pub(crate) fn message_id(body: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos().max(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = blake3::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&count.to_le_bytes());
    hasher.update(body.as_bytes());
    let hash = hasher.finalize().to_hex();
    format!("{nanos:020}-{}", &hash[..16])
}
