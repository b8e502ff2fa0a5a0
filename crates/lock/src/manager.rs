//! Quorum lock manager.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::store::{LockStore, LockStoreError};

/// Default lease duration.
const DEFAULT_LEASE: Duration = Duration::from_secs(5);

/// Default bounded retry budget for one acquisition.
const DEFAULT_RETRY_COUNT: u32 = 10;

/// Base delay between acquisition rounds.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Additional uniform jitter on top of the base delay.
const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(200);

/// Clock drift allowance, as a fraction of the lease duration.
const DEFAULT_DRIFT_FACTOR: f64 = 0.01;

/// Tuning for the quorum acquisition loop.
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub lease: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    pub drift_factor: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_jitter: DEFAULT_RETRY_JITTER,
            drift_factor: DEFAULT_DRIFT_FACTOR,
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// The key is held elsewhere and the retry budget ran out. Retryable by
    /// the caller with backoff, not in a tight loop.
    #[error("lock contention on {0}")]
    Contention(String),

    /// The lease could not be extended on a quorum of stores. The holder
    /// must re-validate its expected version before committing.
    #[error("lease not extended for {0}")]
    NotExtended(String),

    #[error(transparent)]
    Store(#[from] LockStoreError),
}

/// A held lock grant: valid until `valid_until`, reclaimable by others after.
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    token: String,
    fencing_token: u64,
    valid_until: Instant,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Monotonically distinguishable proof of which acquisition is current.
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.valid_until
    }
}

/// Quorum-based mutual-exclusion manager over N independent stores.
///
/// At most one valid holder token exists per key at any instant, enforced by
/// majority agreement, not by any single process.
pub struct LockManager {
    stores: Vec<Arc<dyn LockStore>>,
    config: LockConfig,
}

impl LockManager {
    /// `stores` must be non-empty; a single store degenerates to a plain
    /// expiring lock (quorum of one).
    pub fn new(stores: Vec<Arc<dyn LockStore>>, config: LockConfig) -> Self {
        Self { stores, config }
    }

    fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    fn drift(&self) -> Duration {
        // Small constant floor on top of the proportional drift, so very
        // short leases still get a non-zero allowance.
        self.config.lease.mul_f64(self.config.drift_factor) + Duration::from_millis(2)
    }

    /// Acquire the lock for `key`, retrying with jittered backoff up to the
    /// configured budget before reporting contention.
    pub async fn acquire(&self, key: &str) -> Result<Lease, LockError> {
        let token = Uuid::now_v7().to_string();

        for attempt in 0..=self.config.retry_count {
            let round_start = Instant::now();
            let mut granted = 0usize;
            let mut fencing_token = 0u64;

            for store in &self.stores {
                match store.try_acquire(key, &token, self.config.lease).await {
                    Ok(Some(fence)) => {
                        granted += 1;
                        fencing_token = fencing_token.max(fence);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(key, error = %err, "lock store vote failed");
                    }
                }
            }

            let validity = self
                .config
                .lease
                .saturating_sub(round_start.elapsed())
                .saturating_sub(self.drift());

            if granted >= self.quorum() && !validity.is_zero() {
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                    fencing_token,
                    valid_until: Instant::now() + validity,
                });
            }

            // Partial acquisition must not linger: undo before the next
            // round so a competing majority can form.
            self.release_token(key, &token).await;

            if attempt < self.config.retry_count {
                tokio::time::sleep(self.backoff()).await;
            }
        }

        Err(LockError::Contention(key.to_string()))
    }

    /// Release a lease on all stores (best effort).
    pub async fn release(&self, lease: &Lease) {
        self.release_token(&lease.key, &lease.token).await;
    }

    /// Extend a lease by one lease duration. Requires quorum agreement;
    /// anything less surfaces as [`LockError::NotExtended`].
    pub async fn extend(&self, lease: &Lease) -> Result<Lease, LockError> {
        let round_start = Instant::now();
        let mut extended = 0usize;

        for store in &self.stores {
            match store.extend(&lease.key, &lease.token, self.config.lease).await {
                Ok(true) => extended += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(key = %lease.key, error = %err, "lock store extend failed");
                }
            }
        }

        let validity = self
            .config
            .lease
            .saturating_sub(round_start.elapsed())
            .saturating_sub(self.drift());

        if extended >= self.quorum() && !validity.is_zero() {
            Ok(Lease {
                key: lease.key.clone(),
                token: lease.token.clone(),
                fencing_token: lease.fencing_token,
                valid_until: Instant::now() + validity,
            })
        } else {
            Err(LockError::NotExtended(lease.key.clone()))
        }
    }

    async fn release_token(&self, key: &str, token: &str) {
        for store in &self.stores {
            if let Err(err) = store.release(key, token).await {
                warn!(key, error = %err, "lock store release failed");
            }
        }
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            use rand::Rng;
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.config.retry_delay + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLockStore;

    fn stores(n: usize) -> Vec<Arc<dyn LockStore>> {
        (0..n)
            .map(|_| Arc::new(InMemoryLockStore::new()) as Arc<dyn LockStore>)
            .collect()
    }

    fn fast_config() -> LockConfig {
        LockConfig {
            lease: Duration::from_millis(500),
            retry_count: 2,
            retry_delay: Duration::from_millis(10),
            retry_jitter: Duration::from_millis(5),
            ..LockConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_succeeds_on_free_key() {
        let manager = LockManager::new(stores(3), fast_config());
        let lease = manager.acquire("book:1").await.unwrap();
        assert!(!lease.is_expired());
        assert!(lease.fencing_token() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_key_contends_until_lease_expiry() {
        let manager = LockManager::new(stores(3), fast_config());

        let lease = manager.acquire("book:1").await.unwrap();
        let err = manager.acquire("book:1").await.unwrap_err();
        match err {
            LockError::Contention(key) => assert_eq!(key, "book:1"),
            other => panic!("expected Contention, got {other:?}"),
        }

        // After the lease expires the key is reclaimable.
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(lease.is_expired());
        let reclaimed = manager.acquire("book:1").await.unwrap();
        assert!(reclaimed.fencing_token() > lease.fencing_token());
    }

    #[tokio::test(start_paused = true)]
    async fn release_frees_the_key_immediately() {
        let manager = LockManager::new(stores(3), fast_config());

        let lease = manager.acquire("book:1").await.unwrap();
        manager.release(&lease).await;
        manager.acquire("book:1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn extend_pushes_validity_forward() {
        let manager = LockManager::new(stores(3), fast_config());

        let lease = manager.acquire("book:1").await.unwrap();
        tokio::time::advance(Duration::from_millis(300)).await;
        let extended = manager.extend(&lease).await.unwrap();
        assert!(extended.valid_until() > lease.valid_until());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_after_expiry_reports_not_extended() {
        let manager = LockManager::new(stores(3), fast_config());

        let lease = manager.acquire("book:1").await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        let err = manager.extend(&lease).await.unwrap_err();
        match err {
            LockError::NotExtended(_) => {}
            other => panic!("expected NotExtended, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_survives_minority_store_loss() {
        // One of three stores refuses every operation.
        struct DownStore;

        #[async_trait::async_trait]
        impl LockStore for DownStore {
            async fn try_acquire(
                &self,
                _key: &str,
                _token: &str,
                _ttl: Duration,
            ) -> Result<Option<u64>, LockStoreError> {
                Err(LockStoreError::Backend("connection refused".to_string()))
            }

            async fn release(&self, _key: &str, _token: &str) -> Result<bool, LockStoreError> {
                Err(LockStoreError::Backend("connection refused".to_string()))
            }

            async fn extend(
                &self,
                _key: &str,
                _token: &str,
                _ttl: Duration,
            ) -> Result<bool, LockStoreError> {
                Err(LockStoreError::Backend("connection refused".to_string()))
            }
        }

        let mut set = stores(2);
        set.push(Arc::new(DownStore));
        let manager = LockManager::new(set, fast_config());

        let lease = manager.acquire("book:1").await.unwrap();
        assert!(!lease.is_expired());
    }
}
