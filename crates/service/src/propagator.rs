//! Dual-channel event propagation.
//!
//! Every committed change goes to both the ordered log and the work queue.
//! Publish failures are absorbed: by the time we publish, the mutation is
//! durable in the store, and rolling it back for a broker outage would trade
//! correctness for liveness. Consumers are idempotent; the store remains
//! authoritative (accepted eventual consistency between store and stream).

use std::sync::Arc;

use tracing::warn;

use circulation_breaker::{BreakerConfig, CircuitBreaker};
use circulation_events::{ChangeEvent, EventEnvelope, EventLog, WorkQueue};
use circulation_observability::Metrics;

pub struct EventPropagator {
    log: Arc<dyn EventLog>,
    queue: Arc<dyn WorkQueue>,
    breaker: CircuitBreaker,
    metrics: Arc<Metrics>,
    topic: String,
    queue_name: String,
}

impl EventPropagator {
    pub fn new(
        log: Arc<dyn EventLog>,
        queue: Arc<dyn WorkQueue>,
        metrics: Arc<Metrics>,
        breaker_config: BreakerConfig,
        topic: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        let listener_metrics = metrics.clone();
        Self {
            log,
            queue,
            breaker: CircuitBreaker::new("events", breaker_config)
                .with_listener(move |_, _| listener_metrics.record_breaker_transition()),
            metrics,
            topic: topic.into(),
            queue_name: queue_name.into(),
        }
    }

    /// Publish one committed change to both channels, best effort.
    pub async fn publish(&self, event: ChangeEvent) {
        let envelope = EventEnvelope::new(event);

        if let Err(err) = self.breaker.call(self.log.publish(&self.topic, &envelope)).await {
            warn!(
                topic = %self.topic,
                event_id = %envelope.event_id(),
                error = %err,
                "event log publish failed; continuing"
            );
            self.metrics.record_publish_failure();
        }

        if let Err(err) = self
            .breaker
            .call(self.queue.enqueue(&self.queue_name, &envelope))
            .await
        {
            warn!(
                queue = %self.queue_name,
                event_id = %envelope.event_id(),
                error = %err,
                "work queue publish failed; continuing"
            );
            self.metrics.record_publish_failure();
        }
    }
}
