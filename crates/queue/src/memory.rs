//! In-memory queue for testing.

use crate::error::Result;
use crate::{DEFAULT_MAX_RECEIVES, DEFAULT_VISIBILITY_TIMEOUT, Delivery, Disposition, Queue, message_id};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    pending: VecDeque<Delivery>,
    /// Keyed by ID, with the instant the message becomes visible again.
    in_flight: BTreeMap<String, (Delivery, Instant)>,
    dead: Vec<Delivery>,
    published: Vec<String>,
}

/// In-memory queue for testing.
///
/// Keeps a log of every message ever published so tests can assert on
/// what was sent, even after it has been consumed.
pub struct MemoryQueue {
    name: String,
    max_receives: u32,
    visibility_timeout: Duration,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_receives: DEFAULT_MAX_RECEIVES,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            state: Mutex::new(State::default()),
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

    /// Every body ever published, in publish order.
    pub async fn published(&self) -> Vec<String> {
        self.state.lock().await.published.clone()
    }

    /// Bodies currently waiting to be received.
    pub async fn pending(&self) -> Vec<String> {
        self.state.lock().await.pending.iter().map(|d| d.body.clone()).collect()
    }

    /// Bodies currently in the dead-letter area.
    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead.iter().map(|d| d.body.clone()).collect()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, body: &str) -> Result<String> {
        let id = message_id(body);
        let mut state = self.state.lock().await;
        state.published.push(body.to_string());
        state.pending.push_back(Delivery {
            id: id.clone(),
            body: body.to_string(),
            receive_count: 0,
        });
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> =
            state.in_flight.iter().filter(|(_, (_, visible_at))| *visible_at <= now).map(|(id, _)| id.clone()).collect();
        for id in expired {
            if let Some((message, _)) = state.in_flight.remove(&id) {
                match message.receive_count >= self.max_receives {
                    true => state.dead.push(message),
                    false => state.pending.push_back(message),
                }
            }
        }
        let mut deliveries = Vec::new();
        while deliveries.len() < max
            && let Some(mut delivery) = state.pending.pop_front()
        {
            delivery.receive_count += 1;
            state.in_flight.insert(delivery.id.clone(), (delivery.clone(), now + self.visibility_timeout));
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state.lock().await.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<Disposition> {
        let mut state = self.state.lock().await;
        let Some((message, _)) = state.in_flight.remove(&delivery.id) else {
            // Already acked or dead-lettered.
            return Ok(Disposition::Requeued);
        };
        if message.receive_count >= self.max_receives {
            state.dead.push(message);
            Ok(Disposition::DeadLettered)
        } else {
            let visible_at = Instant::now() + self.visibility_timeout;
            state.in_flight.insert(message.id.clone(), (message, visible_at));
            Ok(Disposition::Requeued)
        }
    }

    async fn redrive(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let dead: Vec<_> = state.dead.drain(..).collect();
        let count = dead.len();
        for mut message in dead {
            message.receive_count = 0;
            state.pending.push_back(message);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_and_ack() {
        let queue = MemoryQueue::new("staging");
        queue.publish("one").await.unwrap();
        queue.publish("two").await.unwrap();
        let deliveries = queue.receive(10).await.unwrap();
        assert_eq!(deliveries.iter().map(|d| d.body.as_str()).collect::<Vec<_>>(), vec!["one", "two"]);
        assert!(deliveries.iter().all(|d| d.receive_count == 1));
        for delivery in &deliveries {
            queue.ack(delivery).await.unwrap();
        }
        assert!(queue.receive(10).await.unwrap().is_empty());
        assert_eq!(queue.published().await, vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_dead_letters_after_max_receives() {
        let queue = MemoryQueue::new("staging").with_max_receives(2).with_visibility_timeout(Duration::from_secs(60));
        queue.publish("flaky").await.unwrap();
        let first = queue.receive(1).await.unwrap().remove(0);
        assert_eq!(queue.nack(&first).await.unwrap(), Disposition::Requeued);
        // Invisible until the timeout passes.
        assert!(queue.receive(1).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;
        let second = queue.receive(1).await.unwrap().remove(0);
        assert_eq!(second.receive_count, 2);
        assert_eq!(queue.nack(&second).await.unwrap(), Disposition::DeadLettered);
        assert!(queue.pending().await.is_empty());
        assert_eq!(queue.dead_letters().await, vec!["flaky"]);

        assert_eq!(queue.redrive().await.unwrap(), 1);
        let redriven = queue.receive(1).await.unwrap().remove(0);
        assert_eq!(redriven.receive_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_messages_expire_into_dead_letters() {
        let queue = MemoryQueue::new("staging").with_max_receives(1).with_visibility_timeout(Duration::from_secs(5));
        queue.publish("abandoned").await.unwrap();
        let _ = queue.receive(1).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(queue.receive(1).await.unwrap().is_empty());
        assert_eq!(queue.dead_letters().await, vec!["abandoned"]);
    }
}
