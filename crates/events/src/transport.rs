//! Transport contracts for the two delivery channels.
//!
//! Implementations make no storage assumptions beyond what each contract
//! states: the log channel is an ordered, durable append; the queue channel
//! tracks in-flight deliveries until they are acknowledged. `publish`/
//! `enqueue` return success only once the transport has durably accepted the
//! message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::EventEnvelope;

/// Publish-side failure. Surfaced to the caller as non-fatal: a failed
/// publish never rolls back the already-committed state mutation.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Consume-side failure.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// An entry read back from the ordered log channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Opaque, totally-ordered position within the topic. Pass the last seen
    /// offset back to [`EventLog::read_from`] to resume.
    pub offset: String,
    pub envelope: EventEnvelope,
}

/// Ordered, delivery-keyed log channel (per-record ordering for downstream
/// systems that replay state).
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably append an envelope to the topic.
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), PublishError>;

    /// Read up to `max` entries after `after` (`None` = from the start).
    /// Consumers track their own offsets; nothing is removed by reading.
    async fn read_from(
        &self,
        topic: &str,
        after: Option<&str>,
        max: usize,
    ) -> Result<Vec<LogEntry>, ConsumeError>;
}

/// A message handed to one queue consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque receipt used to ack/nack this delivery.
    pub receipt: String,
    /// 1 on first delivery; incremented on every requeue.
    pub attempts: u32,
    pub envelope: EventEnvelope,
}

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Transient fault: put the message back for redelivery.
    Requeue,
    /// Poison message: log it and move it to the dead-letter stream.
    DropAfterLog,
}

/// Queue channel with per-message acknowledgement (task-like consumers).
///
/// Deliveries that are never acknowledged are reclaimed and redelivered, so
/// handlers must be idempotent with respect to duplicates.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Durably accept a message onto the queue.
    async fn enqueue(&self, queue: &str, envelope: &EventEnvelope) -> Result<(), PublishError>;

    /// Take the next message for `consumer` in `group`, waiting up to `wait`
    /// for one to arrive. The message stays in-flight until acked or nacked.
    async fn dequeue(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ConsumeError>;

    /// Acknowledge successful processing, removing the message.
    async fn ack(&self, queue: &str, group: &str, delivery: &Delivery) -> Result<(), ConsumeError>;

    /// Negatively acknowledge. `requeue` puts the message back (bounded by
    /// the transport's retry limit, after which it dead-letters); otherwise
    /// it dead-letters immediately.
    async fn nack(
        &self,
        queue: &str,
        group: &str,
        delivery: &Delivery,
        requeue: bool,
    ) -> Result<(), ConsumeError>;
}

#[async_trait]
impl<T> EventLog for Arc<T>
where
    T: EventLog + ?Sized,
{
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        (**self).publish(topic, envelope).await
    }

    async fn read_from(
        &self,
        topic: &str,
        after: Option<&str>,
        max: usize,
    ) -> Result<Vec<LogEntry>, ConsumeError> {
        (**self).read_from(topic, after, max).await
    }
}

#[async_trait]
impl<T> WorkQueue for Arc<T>
where
    T: WorkQueue + ?Sized,
{
    async fn enqueue(&self, queue: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        (**self).enqueue(queue, envelope).await
    }

    async fn dequeue(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ConsumeError> {
        (**self).dequeue(queue, group, consumer, wait).await
    }

    async fn ack(&self, queue: &str, group: &str, delivery: &Delivery) -> Result<(), ConsumeError> {
        (**self).ack(queue, group, delivery).await
    }

    async fn nack(
        &self,
        queue: &str,
        group: &str,
        delivery: &Delivery,
        requeue: bool,
    ) -> Result<(), ConsumeError> {
        (**self).nack(queue, group, delivery, requeue).await
    }
}
