//! Redis Streams-backed ordered log channel.
//!
//! XADD appends are totally ordered within a topic stream, and every
//! envelope carries its delivery key, so consumers that care about one
//! record see its events in commit order. Reading removes nothing;
//! consumers track their own offsets.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use circulation_events::{ConsumeError, EventEnvelope, EventLog, LogEntry, PublishError};

use crate::stream_entry::parse_entry;

#[derive(Clone)]
pub struct RedisEventLog {
    conn: ConnectionManager,
}

impl RedisEventLog {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        // XADD with an auto-generated ID; success means Redis has durably
        // accepted the append.
        let _: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg("delivery_key")
            .arg(envelope.delivery_key())
            .arg("event_type")
            .arg(envelope.event_type())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::Transport(format!("XADD failed: {}", e)))?;

        Ok(())
    }

    async fn read_from(
        &self,
        topic: &str,
        after: Option<&str>,
        max: usize,
    ) -> Result<Vec<LogEntry>, ConsumeError> {
        let start = match after {
            // "(" makes the range exclusive of the last seen ID.
            Some(offset) => format!("({}", offset),
            None => "-".to_string(),
        };

        let mut conn = self.conn.clone();
        let raw: Vec<redis::Value> = redis::cmd("XRANGE")
            .arg(topic)
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| ConsumeError::Transport(format!("XRANGE failed: {}", e)))?;

        let mut entries = Vec::with_capacity(raw.len());
        for value in &raw {
            let Some((id, fields)) = parse_entry(value) else {
                continue;
            };
            let Some(payload) = fields.get("payload") else {
                continue;
            };
            let envelope: EventEnvelope = serde_json::from_str(payload)
                .map_err(|e| ConsumeError::Deserialization(e.to_string()))?;
            entries.push(LogEntry {
                offset: id,
                envelope,
            });
        }
        Ok(entries)
    }
}
