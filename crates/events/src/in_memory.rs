//! In-memory transport implementations for tests/dev.
//!
//! - No IO, no background threads
//! - At-least-once acceptable (consumers must be idempotent)
//! - The work queue ignores consumer groups: tests exercise one group

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::EventEnvelope;
use crate::transport::{
    ConsumeError, Delivery, EventLog, LogEntry, PublishError, WorkQueue,
};

/// Default requeue budget before a message dead-letters.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// In-memory ordered log: one append-only vector per topic.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    topics: Mutex<HashMap<String, Vec<EventEnvelope>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries appended to `topic` so far.
    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    async fn read_from(
        &self,
        topic: &str,
        after: Option<&str>,
        max: usize,
    ) -> Result<Vec<LogEntry>, ConsumeError> {
        let topics = self.topics.lock().unwrap();
        let entries = match topics.get(topic) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        let start = match after {
            Some(offset) => {
                let index: usize = offset
                    .parse()
                    .map_err(|_| ConsumeError::Deserialization(format!("bad offset: {offset}")))?;
                index + 1
            }
            None => 0,
        };

        Ok(entries
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(index, envelope)| LogEntry {
                offset: index.to_string(),
                envelope: envelope.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    id: u64,
    attempts: u32,
    envelope: EventEnvelope,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<QueuedMessage>,
    pending: HashMap<String, QueuedMessage>,
    dead: Vec<EventEnvelope>,
}

/// In-memory ack/nack queue with a bounded requeue budget and a dead-letter
/// list, mirroring the durable implementation's semantics.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    max_attempts: u32,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// Messages that exhausted their retries or were dropped by policy.
    pub fn dead_letters(&self, queue: &str) -> Vec<EventEnvelope> {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|state| state.dead.clone())
            .unwrap_or_default()
    }

    /// Ready + in-flight message count.
    pub fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|state| state.ready.len() + state.pending.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, queue: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_default();
        state.next_id += 1;
        state.ready.push_back(QueuedMessage {
            id: state.next_id,
            attempts: 1,
            envelope: envelope.clone(),
        });
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        _group: &str,
        _consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ConsumeError> {
        // One immediate attempt, one after the wait: enough to emulate a
        // blocking pop for tests without a notifier.
        for attempt in 0..2 {
            {
                let mut queues = self.queues.lock().unwrap();
                if let Some(state) = queues.get_mut(queue) {
                    if let Some(msg) = state.ready.pop_front() {
                        let receipt = msg.id.to_string();
                        let delivery = Delivery {
                            receipt: receipt.clone(),
                            attempts: msg.attempts,
                            envelope: msg.envelope.clone(),
                        };
                        state.pending.insert(receipt, msg);
                        return Ok(Some(delivery));
                    }
                }
            }
            if attempt == 0 {
                tokio::time::sleep(wait).await;
            }
        }
        Ok(None)
    }

    async fn ack(
        &self,
        queue: &str,
        _group: &str,
        delivery: &Delivery,
    ) -> Result<(), ConsumeError> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(queue) {
            state.pending.remove(&delivery.receipt);
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        _group: &str,
        delivery: &Delivery,
        requeue: bool,
    ) -> Result<(), ConsumeError> {
        let mut queues = self.queues.lock().unwrap();
        let state = match queues.get_mut(queue) {
            Some(state) => state,
            None => return Ok(()),
        };
        let msg = match state.pending.remove(&delivery.receipt) {
            Some(msg) => msg,
            None => return Ok(()),
        };

        if requeue && msg.attempts < self.max_attempts {
            state.ready.push_back(QueuedMessage {
                attempts: msg.attempts + 1,
                ..msg
            });
        } else {
            tracing::warn!(
                queue,
                attempts = msg.attempts,
                event_id = %msg.envelope.event_id(),
                "message dead-lettered"
            );
            state.dead.push(msg.envelope);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use circulation_core::BookId;

    use crate::event::{BookCreated, ChangeEvent};

    fn sample_envelope() -> EventEnvelope {
        EventEnvelope::new(ChangeEvent::Created(BookCreated {
            book_id: BookId::new(),
            title: "Dune".to_string(),
            author: "Frank Herbert".to_string(),
            occurred_at: Utc::now(),
        }))
    }

    #[tokio::test]
    async fn log_preserves_order_and_offsets_resume() {
        let log = InMemoryEventLog::new();
        let first = sample_envelope();
        let second = sample_envelope();
        log.publish("library-events", &first).await.unwrap();
        log.publish("library-events", &second).await.unwrap();

        let entries = log.read_from("library-events", None, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].envelope, first);

        let resumed = log
            .read_from("library-events", Some(&entries[0].offset), 10)
            .await
            .unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].envelope, second);
    }

    #[tokio::test]
    async fn ack_removes_message() {
        let queue = InMemoryWorkQueue::new();
        queue
            .enqueue("book-notifications", &sample_envelope())
            .await
            .unwrap();

        let delivery = queue
            .dequeue("book-notifications", "g", "c", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.attempts, 1);

        queue.ack("book-notifications", "g", &delivery).await.unwrap();
        assert_eq!(queue.depth("book-notifications"), 0);

        let next = queue
            .dequeue("book-notifications", "g", "c", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn nack_requeue_increments_attempts_until_dead_letter() {
        let queue = InMemoryWorkQueue::with_max_attempts(2);
        queue.enqueue("q", &sample_envelope()).await.unwrap();

        let first = queue
            .dequeue("q", "g", "c", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        queue.nack("q", "g", &first, true).await.unwrap();

        let second = queue
            .dequeue("q", "g", "c", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempts, 2);

        // Budget exhausted: the requeue turns into a dead-letter.
        queue.nack("q", "g", &second, true).await.unwrap();
        assert_eq!(queue.dead_letters("q").len(), 1);
        assert_eq!(queue.depth("q"), 0);
    }

    #[tokio::test]
    async fn nack_drop_dead_letters_immediately() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue("q", &sample_envelope()).await.unwrap();

        let delivery = queue
            .dequeue("q", "g", "c", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        queue.nack("q", "g", &delivery, false).await.unwrap();

        assert_eq!(queue.dead_letters("q").len(), 1);
    }
}
