//! Queue consumer loop.
//!
//! Drives an idempotent handler over one queue/group, applying the
//! per-consumer acknowledgement policy. One worker task per consumer name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::envelope::EventEnvelope;
use crate::transport::{AckPolicy, WorkQueue};

/// Poll interval when the queue is idle.
const WORKER_TICK: Duration = Duration::from_millis(250);

/// Handler-side processing failure.
#[derive(Debug, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

/// Processes one delivered envelope.
///
/// Must be idempotent: the queue redelivers on reclaim and on requeue.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Generic queue worker loop.
#[derive(Debug)]
pub struct QueueWorker;

impl QueueWorker {
    /// Spawn a task that processes deliveries from `queue_name`.
    ///
    /// - `handler`: must be idempotent (at-least-once delivery safe)
    /// - `policy`: what to do with a delivery whose handler fails
    pub fn spawn(
        name: &'static str,
        queue: Arc<dyn WorkQueue>,
        queue_name: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        policy: AckPolicy,
        handler: Arc<dyn EventHandler>,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue_name = queue_name.into();
        let group = group.into();
        let consumer = consumer.into();

        let join = tokio::spawn(async move {
            worker_loop(
                name,
                queue,
                &queue_name,
                &group,
                &consumer,
                policy,
                handler,
                shutdown_rx,
            )
            .await;
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    name: &'static str,
    queue: Arc<dyn WorkQueue>,
    queue_name: &str,
    group: &str,
    consumer: &str,
    policy: AckPolicy,
    handler: Arc<dyn EventHandler>,
    shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let delivery = match queue.dequeue(queue_name, group, consumer, WORKER_TICK).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                warn!(worker = name, error = %err, "queue dequeue failed");
                tokio::time::sleep(WORKER_TICK).await;
                continue;
            }
        };

        match handler.handle(&delivery.envelope).await {
            Ok(()) => {
                if let Err(err) = queue.ack(queue_name, group, &delivery).await {
                    // The message will be redelivered; the handler is
                    // idempotent, so this only costs a duplicate.
                    warn!(worker = name, error = %err, "ack failed");
                }
            }
            Err(err) => {
                warn!(
                    worker = name,
                    event_id = %delivery.envelope.event_id(),
                    attempts = delivery.attempts,
                    error = %err,
                    "handler failed"
                );
                let requeue = matches!(policy, AckPolicy::Requeue);
                if let Err(nack_err) = queue.nack(queue_name, group, &delivery, requeue).await {
                    warn!(worker = name, error = %nack_err, "nack failed");
                }
            }
        }
    }
}
