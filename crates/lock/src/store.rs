//! Single lock store contract and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

/// Failure talking to one lock store. The manager treats a store error as a
/// "no" vote for that round; it never aborts the quorum on its own.
#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("lock store error: {0}")]
    Backend(String),
}

/// One independent lock store (one voter in the quorum).
///
/// Implementations must expire entries on their own so a crashed holder
/// cannot pin a key forever.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempt to take `key` for `token` with the given lease duration.
    ///
    /// Returns the store's fencing counter for the key on success (the
    /// counter increments with every successful acquisition), or `None`
    /// when another live token holds the key.
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, LockStoreError>;

    /// Release `key` iff it is still held by `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockStoreError>;

    /// Push the expiry of `key` out by `ttl` iff still held by `token`.
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError>;
}

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    fences: HashMap<String, u64>,
}

/// In-memory lock store for tests/dev. Expiry is lazy: an expired entry is
/// treated as absent at the next touch.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    inner: Mutex<Inner>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, LockStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if let Some(entry) = inner.entries.get(key) {
            if entry.expires_at > now && entry.token != token {
                return Ok(None);
            }
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        let fence = inner.fences.entry(key.to_string()).or_insert(0);
        *fence += 1;
        Ok(Some(*fence))
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            Some(entry) if entry.token == token => {
                inner.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        match inner.entries.get_mut(key) {
            Some(entry) if entry.token == token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_token_is_refused_until_expiry() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_millis(500);

        let fence = store.try_acquire("book:1", "a", ttl).await.unwrap();
        assert!(fence.is_some());
        assert!(store.try_acquire("book:1", "b", ttl).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(store.try_acquire("book:1", "b", ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fencing_counter_is_monotonic_per_key() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_millis(100);

        let first = store.try_acquire("k", "a", ttl).await.unwrap().unwrap();
        store.release("k", "a").await.unwrap();
        let second = store.try_acquire("k", "b", ttl).await.unwrap().unwrap();
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn release_requires_matching_token() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_millis(500);

        store.try_acquire("k", "a", ttl).await.unwrap();
        assert!(!store.release("k", "b").await.unwrap());
        assert!(store.release("k", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn extend_fails_after_expiry() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_millis(100);

        store.try_acquire("k", "a", ttl).await.unwrap();
        assert!(store.extend("k", "a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(!store.extend("k", "a", ttl).await.unwrap());
    }
}
