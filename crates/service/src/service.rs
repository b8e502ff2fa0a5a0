//! The consistency core: safe read-modify-write cycles on book records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{instrument, warn};

use circulation_breaker::{BreakerError, CircuitBreaker};
use circulation_cache::Cache;
use circulation_core::{Book, BookId, BookPatch, DomainError, NewBook};
use circulation_events::{BookCreated, BookDeleted, BookUpdated, ChangeEvent};
use circulation_infra::{BookPage, BookStore, ListQuery, StoreError};
use circulation_lock::{Lease, LockError, LockManager};
use circulation_observability::Metrics;

use crate::config::Config;
use crate::error::ServiceError;
use crate::keys;
use crate::propagator::EventPropagator;

/// Orchestrates store, cache, lock manager, and event propagation for one
/// service process.
///
/// All clients are injected and constructed at startup; the service holds
/// no ambient state beyond its breakers and counters. Every operation is
/// safe to call from any number of concurrent tasks.
pub struct BookService {
    store: Arc<dyn BookStore>,
    cache: Arc<dyn Cache>,
    locks: Arc<LockManager>,
    propagator: EventPropagator,
    metrics: Arc<Metrics>,
    store_breaker: CircuitBreaker,
    cache_breaker: CircuitBreaker,
    lock_breaker: CircuitBreaker,
    config: Config,
}

impl BookService {
    pub fn new(
        store: Arc<dyn BookStore>,
        cache: Arc<dyn Cache>,
        locks: Arc<LockManager>,
        propagator: EventPropagator,
        metrics: Arc<Metrics>,
        config: Config,
    ) -> Self {
        let breaker = |name: &str| {
            let listener_metrics = metrics.clone();
            CircuitBreaker::new(name, config.breaker.clone())
                .with_listener(move |_, _| listener_metrics.record_breaker_transition())
        };

        // The lock manager's bounded retry loop runs inside one breaker
        // call, so its timeout must cover the whole retry budget.
        let mut lock_breaker_config = config.breaker.clone();
        lock_breaker_config.call_timeout = config.breaker.call_timeout
            + (config.lock.retry_delay + config.lock.retry_jitter) * (config.lock.retry_count + 1);
        let lock_listener = metrics.clone();
        let lock_breaker = CircuitBreaker::new("lock", lock_breaker_config)
            .with_listener(move |_, _| lock_listener.record_breaker_transition());

        Self {
            store,
            cache,
            locks,
            propagator,
            store_breaker: breaker("store"),
            cache_breaker: breaker("cache"),
            lock_breaker,
            metrics,
            config,
        }
    }

    /// Create a book record.
    #[instrument(skip_all, fields(isbn = %new.isbn), err)]
    pub async fn create_book(&self, new: NewBook) -> Result<Book, ServiceError> {
        let book = Book::create(BookId::new(), new, Utc::now())?;

        let existing = self
            .store_breaker
            .call(self.store.find_by_isbn(&book.isbn))
            .await
            .map_err(ServiceError::from)?;
        if existing.is_some() {
            return Err(ServiceError::Conflict(format!(
                "isbn already exists: {}",
                book.isbn
            )));
        }

        self.store_breaker
            .call(self.store.insert(&book))
            .await
            .map_err(ServiceError::from)?;

        // Only listings can name a book that did not exist before.
        self.invalidate_listings().await;
        self.propagator
            .publish(ChangeEvent::Created(BookCreated {
                book_id: book.id,
                title: book.title.clone(),
                author: book.author.clone(),
                occurred_at: book.created_at,
            }))
            .await;
        Ok(book)
    }

    /// Fetch one record, cache-first.
    pub async fn get_book(&self, id: BookId) -> Result<Book, ServiceError> {
        let key = keys::detail(id);
        if let Some(raw) = self.cache_read(&key, "book_detail").await {
            match serde_json::from_str::<Book>(&raw) {
                Ok(book) => return Ok(book),
                Err(err) => {
                    warn!(key = %key, error = %err, "discarding undecodable cache entry");
                }
            }
        }

        let book = self
            .store_breaker
            .call(self.store.get(id))
            .await
            .map_err(ServiceError::from)?
            .ok_or(ServiceError::NotFound)?;

        self.cache_write(&key, &book, self.config.cache_ttl.detail)
            .await;
        Ok(book)
    }

    /// Filtered, paginated listing, cache-first.
    pub async fn list_books(&self, query: &ListQuery) -> Result<BookPage, ServiceError> {
        let key = keys::list(query);
        if let Some(raw) = self.cache_read(&key, "books_list").await {
            match serde_json::from_str::<BookPage>(&raw) {
                Ok(page) => return Ok(page),
                Err(err) => {
                    warn!(key = %key, error = %err, "discarding undecodable cache entry");
                }
            }
        }

        let page = self
            .store_breaker
            .call(self.store.list(query))
            .await
            .map_err(ServiceError::from)?;

        self.cache_write(&key, &page, self.config.cache_ttl.list)
            .await;
        Ok(page)
    }

    /// Apply a copy-count delta under the record's lock.
    ///
    /// `operator_override` lets operators adjust counts on a record in
    /// Maintenance; ordinary borrow/return traffic leaves it unset.
    #[instrument(skip_all, fields(book_id = %id, delta), err)]
    pub async fn apply_copy_change(
        &self,
        id: BookId,
        delta: i64,
        operator_override: bool,
    ) -> Result<Book, ServiceError> {
        self.mutate_locked(
            id,
            move |book| book.with_copy_delta(delta, operator_override, Utc::now()),
            updated_event,
        )
        .await
    }

    /// Borrow one copy.
    pub async fn borrow_copy(&self, id: BookId) -> Result<Book, ServiceError> {
        self.apply_copy_change(id, -1, false).await
    }

    /// Return one copy.
    pub async fn return_copy(&self, id: BookId) -> Result<Book, ServiceError> {
        self.apply_copy_change(id, 1, false).await
    }

    /// Patch metadata/capacity under the record's lock.
    #[instrument(skip_all, fields(book_id = %id), err)]
    pub async fn update_book(&self, id: BookId, patch: BookPatch) -> Result<Book, ServiceError> {
        self.mutate_locked(
            id,
            move |book| book.with_patch(&patch, Utc::now()),
            updated_event,
        )
        .await
    }

    /// Soft-delete under the record's lock.
    #[instrument(skip_all, fields(book_id = %id), err)]
    pub async fn delete_book(&self, id: BookId) -> Result<(), ServiceError> {
        self.mutate_locked(
            id,
            |book| Ok(book.with_deleted(Utc::now())),
            |old, new| {
                ChangeEvent::Deleted(BookDeleted {
                    book_id: new.id,
                    title: old.title.clone(),
                    occurred_at: new.updated_at,
                })
            },
        )
        .await?;
        Ok(())
    }

    /// The locked read-modify-write cycle shared by every mutation.
    ///
    /// The lease is released on the single exit path below, so no outcome
    /// (including a blown deadline) leaks a held lock past its lease.
    async fn mutate_locked<T, B>(
        &self,
        id: BookId,
        transition: T,
        build_event: B,
    ) -> Result<Book, ServiceError>
    where
        T: Fn(&Book) -> Result<Book, DomainError>,
        B: Fn(&Book, &Book) -> ChangeEvent,
    {
        let lease = self.acquire_lock(id).await?;

        let result = tokio::time::timeout(
            self.config.operation_deadline,
            self.mutate_under_lease(id, &transition, &build_event),
        )
        .await;

        self.locks.release(&lease).await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(ServiceError::Unavailable(
                "operation deadline exceeded".to_string(),
            )),
        }
    }

    async fn mutate_under_lease<T, B>(
        &self,
        id: BookId,
        transition: &T,
        build_event: &B,
    ) -> Result<Book, ServiceError>
    where
        T: Fn(&Book) -> Result<Book, DomainError>,
        B: Fn(&Book, &Book) -> ChangeEvent,
    {
        let (mut current, mut from_cache) = self.read_for_update(id, true).await?;

        loop {
            let next = transition(&current).map_err(ServiceError::from)?;

            match self
                .store_breaker
                .call(self.store.update(&next, current.version))
                .await
            {
                Ok(()) => {
                    // Invalidation strictly after the commit, never before.
                    self.invalidate_record(id).await;
                    self.propagator.publish(build_event(&current, &next)).await;
                    return Ok(next);
                }
                Err(BreakerError::Inner(StoreError::VersionConflict(msg))) if from_cache => {
                    // The cached read was stale (a prior invalidation was
                    // absorbed while the cache was degraded). Re-read from
                    // the store and retry once.
                    warn!(book_id = %id, %msg, "stale cached read; retrying from store");
                    self.cache_delete(&keys::detail(id)).await;
                    let (fresh, _) = self.read_for_update(id, false).await?;
                    current = fresh;
                    from_cache = false;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Current state for a mutation: cache when allowed, store otherwise.
    async fn read_for_update(
        &self,
        id: BookId,
        allow_cache: bool,
    ) -> Result<(Book, bool), ServiceError> {
        if allow_cache {
            if let Some(raw) = self.cache_read(&keys::detail(id), "book_detail").await {
                match serde_json::from_str::<Book>(&raw) {
                    Ok(book) => return Ok((book, true)),
                    Err(err) => {
                        warn!(book_id = %id, error = %err, "discarding undecodable cache entry");
                    }
                }
            }
        }

        let book = self
            .store_breaker
            .call(self.store.get(id))
            .await
            .map_err(ServiceError::from)?
            .ok_or(ServiceError::NotFound)?;
        Ok((book, false))
    }

    async fn acquire_lock(&self, id: BookId) -> Result<Lease, ServiceError> {
        let key = keys::lock(id);
        match self.lock_breaker.call(self.locks.acquire(&key)).await {
            Ok(lease) => Ok(lease),
            Err(BreakerError::Inner(LockError::Contention(key))) => {
                self.metrics.record_lock_contention();
                Err(ServiceError::Conflict(format!("record is locked: {}", key)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn cache_read(&self, key: &str, kind: &str) -> Option<String> {
        match self.cache_breaker.call(self.cache.get(key)).await {
            Ok(Some(value)) => {
                self.metrics.record_cache_hit(kind);
                Some(value)
            }
            Ok(None) => {
                self.metrics.record_cache_miss(kind);
                None
            }
            Err(err) => {
                warn!(key, error = %err, "cache read degraded; serving from store");
                self.metrics.record_cache_miss(kind);
                None
            }
        }
    }

    async fn cache_write<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, error = %err, "cache serialization failed; skipping");
                return;
            }
        };
        if let Err(err) = self.cache_breaker.call(self.cache.set(key, &raw, ttl)).await {
            warn!(key, error = %err, "cache write degraded; continuing");
        }
    }

    async fn cache_delete(&self, key: &str) {
        if let Err(err) = self.cache_breaker.call(self.cache.delete(key)).await {
            warn!(key, error = %err, "cache invalidation degraded; TTL will bound staleness");
        }
    }

    async fn invalidate_listings(&self) {
        if let Err(err) = self
            .cache_breaker
            .call(self.cache.delete_prefix(keys::LIST_PREFIX))
            .await
        {
            warn!(error = %err, "listing invalidation degraded; TTL will bound staleness");
        }
    }

    async fn invalidate_record(&self, id: BookId) {
        self.cache_delete(&keys::detail(id)).await;
        self.invalidate_listings().await;
    }
}

fn updated_event(old: &Book, new: &Book) -> ChangeEvent {
    ChangeEvent::Updated(BookUpdated {
        book_id: new.id,
        changed_fields: old
            .changed_fields(new)
            .into_iter()
            .map(String::from)
            .collect(),
        available_copies: new.available_copies,
        status: new.status,
        version: new.version,
        occurred_at: new.updated_at,
    })
}
