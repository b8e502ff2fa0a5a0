//! Redis Streams-backed acknowledgement queue.
//!
//! Consumer groups give each message to one consumer in the group; the
//! message stays in the group's pending list until XACKed. Deliveries left
//! pending by a crashed consumer are reclaimed with XAUTOCLAIM after an idle
//! window. A bounded requeue budget keeps poison messages from cycling
//! forever: past it they land on the dead-letter stream.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;

use circulation_events::{ConsumeError, Delivery, EventEnvelope, PublishError, WorkQueue};

use crate::stream_entry::parse_entry;

/// Default requeue budget before a message dead-letters.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default idle time before a pending delivery is reclaimed from its
/// (presumed dead) consumer.
const DEFAULT_RECLAIM_IDLE: Duration = Duration::from_secs(60);

/// Dead-letter stream suffix.
const DLQ_SUFFIX: &str = ":dlq";

#[derive(Clone)]
pub struct RedisWorkQueue {
    conn: ConnectionManager,
    max_attempts: u32,
    reclaim_idle: Duration,
}

impl RedisWorkQueue {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reclaim_idle: DEFAULT_RECLAIM_IDLE,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Ensure a consumer group exists (idempotent).
    async fn ensure_group(&self, queue: &str, group: &str) {
        let mut conn = self.conn.clone();
        // MKSTREAM creates the stream if absent; an existing group returns
        // BUSYGROUP, which we ignore.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
    }

    /// Reclaim one delivery left idle by a dead consumer, if any.
    async fn reclaim_one(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<(String, HashMap<String, String>)>, ConsumeError> {
        let mut conn = self.conn.clone();
        let raw: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(group)
            .arg(consumer)
            .arg(self.reclaim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| ConsumeError::Transport(format!("XAUTOCLAIM failed: {}", e)))?;

        // Reply: [next_cursor, [entries...], ...]
        let redis::Value::Bulk(parts) = raw else {
            return Ok(None);
        };
        let Some(redis::Value::Bulk(entries)) = parts.get(1) else {
            return Ok(None);
        };
        Ok(entries.first().and_then(parse_entry))
    }

    /// Read one new message for this consumer, blocking up to `wait`.
    async fn read_new(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<(String, HashMap<String, String>)>, ConsumeError> {
        let mut conn = self.conn.clone();
        let raw: Option<HashMap<String, Vec<redis::Value>>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| ConsumeError::Transport(format!("XREADGROUP failed: {}", e)))?;

        let Some(streams) = raw else {
            return Ok(None); // Blocking timeout, no new messages.
        };
        let Some(entries) = streams.get(queue) else {
            return Ok(None);
        };
        Ok(entries.first().and_then(parse_entry))
    }

    fn build_delivery(
        id: String,
        fields: &HashMap<String, String>,
    ) -> Result<Delivery, ConsumeError> {
        let payload = fields
            .get("payload")
            .ok_or_else(|| ConsumeError::Deserialization("missing payload field".to_string()))?;
        let envelope: EventEnvelope = serde_json::from_str(payload)
            .map_err(|e| ConsumeError::Deserialization(e.to_string()))?;
        let attempts = fields
            .get("attempts")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(1);
        Ok(Delivery {
            receipt: id,
            attempts,
            envelope,
        })
    }

    async fn append(
        &self,
        stream: &str,
        envelope: &EventEnvelope,
        attempts: u32,
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("attempts")
            .arg(attempts)
            .arg("event_type")
            .arg(envelope.event_type())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::Transport(format!("XADD failed: {}", e)))?;
        Ok(())
    }

    /// Acknowledge and delete one message.
    async fn remove(&self, queue: &str, group: &str, receipt: &str) -> Result<(), ConsumeError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(queue)
            .arg(group)
            .arg(receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| ConsumeError::Transport(format!("XACK failed: {}", e)))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(queue)
            .arg(receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| ConsumeError::Transport(format!("XDEL failed: {}", e)))?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        queue: &str,
        delivery: &Delivery,
    ) -> Result<(), ConsumeError> {
        warn!(
            queue,
            receipt = %delivery.receipt,
            attempts = delivery.attempts,
            event_id = %delivery.envelope.event_id(),
            "message dead-lettered"
        );
        let dlq = format!("{}{}", queue, DLQ_SUFFIX);
        self.append(&dlq, &delivery.envelope, delivery.attempts)
            .await
            .map_err(|e| ConsumeError::Transport(e.to_string()))
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, queue: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        self.append(queue, envelope, 1).await
    }

    async fn dequeue(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, ConsumeError> {
        self.ensure_group(queue, group).await;

        let entry = match self.reclaim_one(queue, group, consumer).await? {
            Some(entry) => Some(entry),
            None => self.read_new(queue, group, consumer, wait).await?,
        };
        let Some((id, fields)) = entry else {
            return Ok(None);
        };

        let delivery = Self::build_delivery(id, &fields)?;
        if delivery.attempts > self.max_attempts {
            // Over-budget redelivery (e.g. reclaimed from a crash loop).
            self.dead_letter(queue, &delivery).await?;
            self.remove(queue, group, &delivery.receipt).await?;
            return Ok(None);
        }
        Ok(Some(delivery))
    }

    async fn ack(&self, queue: &str, group: &str, delivery: &Delivery) -> Result<(), ConsumeError> {
        self.remove(queue, group, &delivery.receipt).await
    }

    async fn nack(
        &self,
        queue: &str,
        group: &str,
        delivery: &Delivery,
        requeue: bool,
    ) -> Result<(), ConsumeError> {
        if requeue && delivery.attempts < self.max_attempts {
            // Immediate requeue with a bumped attempt count; the old entry
            // goes away so the stream holds one copy.
            self.append(queue, &delivery.envelope, delivery.attempts + 1)
                .await
                .map_err(|e| ConsumeError::Transport(e.to_string()))?;
        } else {
            self.dead_letter(queue, delivery).await?;
        }
        self.remove(queue, group, &delivery.receipt).await
    }
}
