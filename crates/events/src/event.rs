use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use circulation_core::{BookId, BookStatus};

/// Common metadata every change event exposes.
pub trait Event {
    fn event_type(&self) -> &'static str;
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Event: a book record was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookCreated {
    pub book_id: BookId,
    pub title: String,
    pub author: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a book record was mutated.
///
/// Carries the changed-field list plus the post-mutation availability
/// snapshot, so per-record-ordered consumers can track state without a
/// read-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUpdated {
    pub book_id: BookId,
    pub changed_fields: Vec<String>,
    pub available_copies: u32,
    pub status: BookStatus,
    pub version: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a book record was soft-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDeleted {
    pub book_id: BookId,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
}

/// Closed set of change notifications.
///
/// Emitted only after the corresponding mutation has been durably committed.
/// Adding a variant is a compile-time change for every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Created(BookCreated),
    Updated(BookUpdated),
    Deleted(BookDeleted),
}

impl ChangeEvent {
    /// The record this event is about (also its delivery/partition key).
    pub fn book_id(&self) -> BookId {
        match self {
            ChangeEvent::Created(e) => e.book_id,
            ChangeEvent::Updated(e) => e.book_id,
            ChangeEvent::Deleted(e) => e.book_id,
        }
    }
}

impl Event for ChangeEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ChangeEvent::Created(_) => "book.created",
            ChangeEvent::Updated(_) => "book.updated",
            ChangeEvent::Deleted(_) => "book.deleted",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ChangeEvent::Created(e) => e.occurred_at,
            ChangeEvent::Updated(e) => e.occurred_at,
            ChangeEvent::Deleted(e) => e.occurred_at,
        }
    }
}
