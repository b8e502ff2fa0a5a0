//! Read-through cache contract and the in-memory TTL implementation.
//!
//! The cache is a disposable accelerator in front of the authoritative
//! store. Every operation is best-effort from the caller's point of view: a
//! backend failure must never fail the overall operation. Callers fall back
//! to the store and log a degraded-mode signal. Absence of an entry is
//! always safe.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

/// Cache backend failure. Callers absorb these; they never escalate.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key/value cache with TTL and prefix invalidation.
///
/// Values are serialized JSON strings; typed (de)serialization happens at
/// the call site. `delete_prefix` exists so one record mutation can
/// invalidate the whole family of cached listings that could include it,
/// and must only ever be called after the authoritative write commits.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`; returns how many went away.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

#[async_trait]
impl<T> Cache for std::sync::Arc<T>
where
    T: Cache + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        (**self).delete_prefix(prefix).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory TTL cache for tests/dev. Expiry is lazy: entries are dropped
/// when touched past their deadline.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry count (expired entries excluded).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_then_get_roundtrips_until_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("book:1", "{\"title\":\"Dune\"}", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(
            cache.get("book:1").await.unwrap().as_deref(),
            Some("{\"title\":\"Dune\"}")
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("book:1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_prefix_removes_the_family_only() {
        let cache = InMemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("books:list:page=1", "[]", ttl).await.unwrap();
        cache.set("books:list:page=2", "[]", ttl).await.unwrap();
        cache.set("book:42", "{}", ttl).await.unwrap();

        let removed = cache.delete_prefix("books:list:").await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("books:list:page=1").await.unwrap().is_none());
        assert!(cache.get("book:42").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_refreshes_value_and_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("k", "old", Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(900)).await;
        cache
            .set("k", "new", Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }
}
