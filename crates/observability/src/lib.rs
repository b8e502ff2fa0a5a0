//! Observability: tracing initialization and service counters.

mod metrics;
mod tracing_init;

pub use metrics::{Metrics, MetricsSnapshot};
pub use tracing_init::init;
