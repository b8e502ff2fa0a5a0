//! Per-dependency circuit breaker.
//!
//! Wraps each dependency call with a timeout and a Closed → Open → HalfOpen
//! state machine. While Open, calls fail immediately with
//! [`BreakerError::Rejected`] (no round trip) until the reset timer elapses;
//! HalfOpen lets a bounded number of trial calls through and closes again
//! only if they all succeed.
//!
//! A breaker-induced rejection is a different variant from the wrapped
//! call's own failure, so callers can apply different retry policy to each.

mod window;

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::window::RollingWindow;

/// Default per-call timeout; a slower call counts as a failure.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default failure-rate threshold that trips the breaker.
const DEFAULT_FAILURE_RATE: f64 = 0.5;

/// Default minimum calls in the window before the rate is meaningful.
const DEFAULT_MIN_CALLS: u32 = 5;

/// Default rolling window span and bucket count.
const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
const DEFAULT_BUCKETS: usize = 10;

/// Default time in Open before trial calls are allowed.
const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default trial budget in HalfOpen.
const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub call_timeout: Duration,
    pub failure_rate: f64,
    pub min_calls: u32,
    pub window: Duration,
    pub buckets: usize,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            failure_rate: DEFAULT_FAILURE_RATE,
            min_calls: DEFAULT_MIN_CALLS,
            window: DEFAULT_WINDOW,
            buckets: DEFAULT_BUCKETS,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

/// Breaker state, in dependency-health order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Failure of a breaker-wrapped call.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open (or out of half-open trial budget): the
    /// dependency was never called.
    #[error("circuit open: call rejected")]
    Rejected,

    /// The dependency call exceeded the configured timeout.
    #[error("dependency call timed out")]
    Timeout,

    /// The dependency call itself failed.
    #[error("dependency call failed: {0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the failure was produced by the breaker, not the
    /// dependency (useful for choosing a retry policy).
    pub fn is_breaker_induced(&self) -> bool {
        matches!(self, BreakerError::Rejected)
    }
}

/// Notified on every state transition (old, new). Used for counters.
pub type TransitionListener = dyn Fn(BreakerState, BreakerState) + Send + Sync;

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

enum Admission {
    Reject,
    Proceed { trial: bool },
}

/// One breaker instance per dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    listener: Option<Box<TransitionListener>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let window = RollingWindow::new(config.window, config.buckets);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window,
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
            listener: None,
        }
    }

    /// Attach a transition listener (e.g. a metrics counter).
    pub fn with_listener(
        mut self,
        listener: impl Fn(BreakerState, BreakerState) + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Run `fut` through the breaker.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match self.admit() {
            Admission::Reject => return Err(BreakerError::Rejected),
            Admission::Proceed { trial } => {
                let outcome = tokio::time::timeout(self.config.call_timeout, fut).await;
                match outcome {
                    Ok(Ok(value)) => {
                        self.on_success(trial);
                        Ok(value)
                    }
                    Ok(Err(err)) => {
                        self.on_failure(trial);
                        Err(BreakerError::Inner(err))
                    }
                    Err(_) => {
                        self.on_failure(trial);
                        Err(BreakerError::Timeout)
                    }
                }
            }
        }
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => Admission::Proceed { trial: false },
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen, now);
                    inner.half_open_in_flight = 1;
                    Admission::Proceed { trial: true }
                } else {
                    Admission::Reject
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight + inner.half_open_successes
                    >= self.config.half_open_max_calls
                {
                    Admission::Reject
                } else {
                    inner.half_open_in_flight += 1;
                    Admission::Proceed { trial: true }
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if trial && inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_max_calls {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
        } else {
            inner.window.record_success(now);
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if trial && inner.state == BreakerState::HalfOpen {
            // Any failed trial reopens and restarts the reset timer.
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            self.transition(&mut inner, BreakerState::Open, now);
            return;
        }

        inner.window.record_failure(now);
        let (total, failures) = inner.window.totals(now);
        if inner.state == BreakerState::Closed
            && total >= self.config.min_calls
            && f64::from(failures) / f64::from(total) >= self.config.failure_rate
        {
            self.transition(&mut inner, BreakerState::Open, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(now);
                inner.window.reset(now);
                warn!(breaker = %self.name, "circuit breaker opened");
            }
            BreakerState::HalfOpen => {
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                info!(breaker = %self.name, "circuit breaker half-opened");
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.window.reset(now);
                info!(breaker = %self.name, "circuit breaker closed");
            }
        }
        if let Some(listener) = &self.listener {
            listener(from, to);
        }
    }
}

impl core::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            call_timeout: Duration::from_millis(100),
            failure_rate: 0.5,
            min_calls: 3,
            window: Duration::from_secs(1),
            buckets: 4,
            reset_timeout: Duration::from_millis(500),
            half_open_max_calls: 2,
        }
    }

    async fn fail(calls: &AtomicU32) -> Result<(), &'static str> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err("backend down")
    }

    async fn succeed(calls: &AtomicU32) -> Result<(), &'static str> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn trips_open_after_failure_rate_exceeded() {
        let breaker = CircuitBreaker::new("store", fast_config());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = breaker.call(fail(&calls)).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Open fails fast: the underlying call is never attempted.
        let before = calls.load(Ordering::SeqCst);
        let err = breaker.call(fail(&calls)).await.unwrap_err();
        assert!(matches!(err, BreakerError::Rejected));
        assert!(err.is_breaker_induced());
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_again_after_successful_trials() {
        let breaker = CircuitBreaker::new("store", fast_config());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = breaker.call(fail(&calls)).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(600)).await;

        // Two successful trials close the breaker.
        breaker.call(succeed(&calls)).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.call(succeed(&calls)).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_and_restarts_reset_timer() {
        let breaker = CircuitBreaker::new("store", fast_config());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = breaker.call(fail(&calls)).await;
        }
        tokio::time::advance(Duration::from_millis(600)).await;

        let _ = breaker.call(fail(&calls)).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Still open before the restarted timer elapses.
        tokio::time::advance(Duration::from_millis(300)).await;
        let err = breaker.call(succeed(&calls)).await.unwrap_err();
        assert!(matches!(err, BreakerError::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_counts_as_failure() {
        let breaker = CircuitBreaker::new("store", fast_config());

        for _ in 0..3 {
            let err = breaker
                .call(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<(), &'static str>(())
                })
                .await
                .unwrap_err();
            assert!(matches!(err, BreakerError::Timeout));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn successes_keep_the_breaker_closed() {
        let breaker = CircuitBreaker::new("store", fast_config());
        let calls = AtomicU32::new(0);

        for _ in 0..10 {
            breaker.call(succeed(&calls)).await.unwrap();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_sees_transitions() {
        let transitions = Arc::new(AtomicU32::new(0));
        let seen = transitions.clone();
        let breaker = CircuitBreaker::new("store", fast_config())
            .with_listener(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = breaker.call(fail(&calls)).await;
        }
        // Closed -> Open.
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }
}
