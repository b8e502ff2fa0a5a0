//! Bucketed rolling outcome window.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    successes: u32,
    failures: u32,
}

/// Fixed-size ring of time buckets tracking call outcomes over a rolling
/// window. Buckets that fall out of the window are cleared lazily as time
/// advances.
#[derive(Debug)]
pub(crate) struct RollingWindow {
    buckets: Vec<Bucket>,
    bucket_span: Duration,
    current: usize,
    rotated_at: Instant,
}

impl RollingWindow {
    pub(crate) fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: vec![Bucket::default(); buckets],
            bucket_span: window / buckets as u32,
            current: 0,
            rotated_at: Instant::now(),
        }
    }

    /// Rotate past buckets according to elapsed time.
    fn advance(&mut self, now: Instant) {
        if self.bucket_span.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.rotated_at);
        let steps = (elapsed.as_nanos() / self.bucket_span.as_nanos()) as usize;
        if steps == 0 {
            return;
        }
        for _ in 0..steps.min(self.buckets.len()) {
            self.current = (self.current + 1) % self.buckets.len();
            self.buckets[self.current] = Bucket::default();
        }
        if steps >= self.buckets.len() {
            self.rotated_at = now;
        } else {
            self.rotated_at += self.bucket_span * steps as u32;
        }
    }

    pub(crate) fn record_success(&mut self, now: Instant) {
        self.advance(now);
        self.buckets[self.current].successes += 1;
    }

    pub(crate) fn record_failure(&mut self, now: Instant) {
        self.advance(now);
        self.buckets[self.current].failures += 1;
    }

    /// `(total calls, failures)` currently inside the window.
    pub(crate) fn totals(&mut self, now: Instant) -> (u32, u32) {
        self.advance(now);
        let mut total = 0;
        let mut failures = 0;
        for bucket in &self.buckets {
            total += bucket.successes + bucket.failures;
            failures += bucket.failures;
        }
        (total, failures)
    }

    pub(crate) fn reset(&mut self, now: Instant) {
        for bucket in &mut self.buckets {
            *bucket = Bucket::default();
        }
        self.rotated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn outcomes_age_out_of_the_window() {
        let mut window = RollingWindow::new(Duration::from_secs(1), 4);
        let now = Instant::now();
        window.record_failure(now);
        window.record_failure(now);
        assert_eq!(window.totals(now), (2, 2));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(window.totals(Instant::now()), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_aging_keeps_recent_buckets() {
        let mut window = RollingWindow::new(Duration::from_secs(1), 4);
        window.record_failure(Instant::now());

        tokio::time::advance(Duration::from_millis(300)).await;
        window.record_success(Instant::now());

        // The first bucket is still inside the 1s window.
        let (total, failures) = window.totals(Instant::now());
        assert_eq!((total, failures), (2, 1));
    }
}
