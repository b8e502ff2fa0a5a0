use serde::{Deserialize, Serialize};
use uuid::Uuid;

use circulation_core::BookId;

use crate::event::{ChangeEvent, Event};

/// Envelope for a change event: the unit both transport channels carry.
///
/// `delivery_key` partitions the ordered log channel; it is derived from the
/// subject record so all events for one book share a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,
    book_id: BookId,
    delivery_key: String,
    event_type: String,
    payload: ChangeEvent,
}

impl EventEnvelope {
    pub fn new(payload: ChangeEvent) -> Self {
        let book_id = payload.book_id();
        Self {
            event_id: Uuid::now_v7(),
            book_id,
            delivery_key: book_id.to_string(),
            event_type: payload.event_type().to_string(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn book_id(&self) -> BookId {
        self.book_id
    }

    pub fn delivery_key(&self) -> &str {
        &self.delivery_key
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &ChangeEvent {
        &self.payload
    }

    pub fn into_payload(self) -> ChangeEvent {
        self.payload
    }
}
