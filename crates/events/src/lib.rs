//! Change-event model and the dual-channel transport contracts.
//!
//! Two independent delivery paths coexist (mirroring the deployed topology):
//! an ordered, delivery-keyed log channel for consumers that need per-record
//! ordering, and a queue channel with per-message acknowledgement for
//! task-like consumers. Both carry the same [`EventEnvelope`].
//!
//! Delivery is at-least-once on both channels; handlers must be idempotent.

mod envelope;
mod event;
mod in_memory;
mod transport;
mod worker;

pub use envelope::EventEnvelope;
pub use event::{BookCreated, BookDeleted, BookUpdated, ChangeEvent, Event};
pub use in_memory::{InMemoryEventLog, InMemoryWorkQueue};
pub use transport::{
    AckPolicy, ConsumeError, Delivery, EventLog, LogEntry, PublishError, WorkQueue,
};
pub use worker::{EventHandler, HandlerError, QueueWorker, WorkerHandle};
