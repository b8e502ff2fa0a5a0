//! Fire-and-forget service counters.
//!
//! Counters are plain relaxed atomics: recording never blocks, never fails,
//! and never participates in the outcome of the operation being measured.
//! An exporter (out of scope here) can poll `snapshot()`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counter set for one service process.
#[derive(Debug, Default)]
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    lock_contention: AtomicU64,
    breaker_transitions: AtomicU64,
    publish_failures: AtomicU64,
}

/// Point-in-time view of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub lock_contention: u64,
    pub breaker_transitions: u64,
    pub publish_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read was served from the cache.
    pub fn record_cache_hit(&self, kind: &str) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cache_type = kind, "cache hit");
    }

    /// A read fell through to the authoritative store.
    pub fn record_cache_miss(&self, kind: &str) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cache_type = kind, "cache miss");
    }

    /// A lock acquisition gave up after exhausting its retries.
    pub fn record_lock_contention(&self) {
        self.lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    /// A circuit breaker changed state.
    pub fn record_breaker_transition(&self) {
        self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// An event publish was accepted-and-absorbed as failed.
    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = Metrics::new();
        metrics.record_cache_hit("book_detail");
        metrics.record_cache_hit("books_list");
        metrics.record_cache_miss("book_detail");
        metrics.record_lock_contention();
        metrics.record_publish_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.lock_contention, 1);
        assert_eq!(snap.breaker_transitions, 0);
        assert_eq!(snap.publish_failures, 1);
    }
}
