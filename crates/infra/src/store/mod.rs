//! Authoritative book store.
//!
//! The store is the single source of truth and the only component mutated
//! directly. It offers atomic single-record read/write with an optimistic
//! version counter: `update` persists a state only while the stored version
//! still matches the one the caller read, which is the commit-time backstop
//! against stale writers whose lease lapsed.

mod in_memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use circulation_core::{Book, BookCategory, BookId, BookStatus};

pub use in_memory::InMemoryBookStore;
pub use postgres::PostgresBookStore;

/// Store operation error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with the given id (or it is soft-deleted).
    #[error("record not found")]
    NotFound,

    /// Optimistic concurrency check failed: the record moved underneath the
    /// caller.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// A record with this ISBN already exists.
    #[error("duplicate isbn: {0}")]
    DuplicateIsbn(String),

    /// The backend itself failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Structured listing filter with pagination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub category: Option<BookCategory>,
    pub author: Option<String>,
    pub status: Option<BookStatus>,
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            category: None,
            author: None,
            status: None,
            page: 1,
            limit: 10,
        }
    }
}

impl ListQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }
}

/// One page of listing results.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BookPage {
    pub books: Vec<Book>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

impl BookPage {
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            0
        } else {
            self.total.div_ceil(u64::from(self.limit))
        }
    }
}

/// Atomic single-record store with optimistic version counters.
#[async_trait]
pub trait BookStore: Send + Sync {
    /// Insert a fresh record. Fails with [`StoreError::DuplicateIsbn`] when
    /// a live record already carries the ISBN.
    async fn insert(&self, book: &Book) -> Result<(), StoreError>;

    /// Fetch by id; soft-deleted records read as absent.
    async fn get(&self, id: BookId) -> Result<Option<Book>, StoreError>;

    /// Fetch by ISBN; soft-deleted records read as absent.
    async fn find_by_isbn(&self, isbn: &str) -> Result<Option<Book>, StoreError>;

    /// Persist `book` iff the stored version still equals
    /// `expected_version`. Soft deletes go through here too (the record's
    /// `deleted` flag is part of its state).
    async fn update(&self, book: &Book, expected_version: u64) -> Result<(), StoreError>;

    /// Filtered, paginated listing of live records.
    async fn list(&self, query: &ListQuery) -> Result<BookPage, StoreError>;
}

#[async_trait]
impl<S> BookStore for Arc<S>
where
    S: BookStore + ?Sized,
{
    async fn insert(&self, book: &Book) -> Result<(), StoreError> {
        (**self).insert(book).await
    }

    async fn get(&self, id: BookId) -> Result<Option<Book>, StoreError> {
        (**self).get(id).await
    }

    async fn find_by_isbn(&self, isbn: &str) -> Result<Option<Book>, StoreError> {
        (**self).find_by_isbn(isbn).await
    }

    async fn update(&self, book: &Book, expected_version: u64) -> Result<(), StoreError> {
        (**self).update(book, expected_version).await
    }

    async fn list(&self, query: &ListQuery) -> Result<BookPage, StoreError> {
        (**self).list(query).await
    }
}
