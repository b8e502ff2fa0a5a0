//! In-memory book store for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use circulation_core::{Book, BookId};

use super::{BookPage, BookStore, ListQuery, StoreError};

/// HashMap-backed store. The whole map sits behind one mutex, which is
/// plenty for tests: the interesting concurrency lives in the lock manager
/// and the version check, both of which behave identically here and in
/// Postgres.
#[derive(Debug, Default)]
pub struct InMemoryBookStore {
    books: Mutex<HashMap<BookId, Book>>,
}

impl InMemoryBookStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records including soft-deleted ones.
    pub fn raw_len(&self) -> usize {
        self.books.lock().unwrap().len()
    }
}

#[async_trait]
impl BookStore for InMemoryBookStore {
    async fn insert(&self, book: &Book) -> Result<(), StoreError> {
        let mut books = self.books.lock().unwrap();
        let duplicate = books
            .values()
            .any(|existing| !existing.deleted && existing.isbn == book.isbn);
        if duplicate {
            return Err(StoreError::DuplicateIsbn(book.isbn.clone()));
        }
        books.insert(book.id, book.clone());
        Ok(())
    }

    async fn get(&self, id: BookId) -> Result<Option<Book>, StoreError> {
        let books = self.books.lock().unwrap();
        Ok(books.get(&id).filter(|book| !book.deleted).cloned())
    }

    async fn find_by_isbn(&self, isbn: &str) -> Result<Option<Book>, StoreError> {
        let books = self.books.lock().unwrap();
        Ok(books
            .values()
            .find(|book| !book.deleted && book.isbn == isbn)
            .cloned())
    }

    async fn update(&self, book: &Book, expected_version: u64) -> Result<(), StoreError> {
        let mut books = self.books.lock().unwrap();
        let existing = books.get(&book.id).ok_or(StoreError::NotFound)?;
        if existing.version != expected_version {
            return Err(StoreError::VersionConflict(format!(
                "expected version {}, found {}",
                expected_version, existing.version
            )));
        }
        books.insert(book.id, book.clone());
        Ok(())
    }

    async fn list(&self, query: &ListQuery) -> Result<BookPage, StoreError> {
        let books = self.books.lock().unwrap();
        let mut matching: Vec<Book> = books
            .values()
            .filter(|book| !book.deleted)
            .filter(|book| query.category.is_none_or(|c| book.category == c))
            .filter(|book| {
                query
                    .author
                    .as_deref()
                    .is_none_or(|a| book.author.to_lowercase().contains(&a.to_lowercase()))
            })
            .filter(|book| query.status.is_none_or(|s| book.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_uuid().cmp(b.id.as_uuid()))
        });

        let total = matching.len() as u64;
        let books = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit as usize)
            .collect();

        Ok(BookPage {
            books,
            total,
            page: query.page,
            limit: query.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use circulation_core::{BookCategory, BookStatus, NewBook};

    fn sample(isbn: &str, category: BookCategory) -> Book {
        Book::create(
            BookId::new(),
            NewBook {
                title: format!("Title {}", isbn),
                author: "Ursula K. Le Guin".to_string(),
                isbn: isbn.to_string(),
                publisher: None,
                published_year: None,
                category,
                total_copies: 2,
                available_copies: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_isbn() {
        let store = InMemoryBookStore::new();
        store.insert(&sample("i-1", BookCategory::Fiction)).await.unwrap();

        let err = store
            .insert(&sample("i-1", BookCategory::Fiction))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIsbn(_)));
    }

    #[tokio::test]
    async fn update_enforces_expected_version() {
        let store = InMemoryBookStore::new();
        let book = sample("i-1", BookCategory::Fiction);
        store.insert(&book).await.unwrap();

        let next = book.with_copy_delta(-1, false, Utc::now()).unwrap();
        store.update(&next, book.version).await.unwrap();

        // Re-running the same transition from the stale base must conflict.
        let stale = book.with_copy_delta(-1, false, Utc::now()).unwrap();
        let err = store.update(&stale, book.version).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[tokio::test]
    async fn soft_deleted_records_read_as_absent() {
        let store = InMemoryBookStore::new();
        let book = sample("i-1", BookCategory::Fiction);
        store.insert(&book).await.unwrap();

        let deleted = book.with_deleted(Utc::now());
        store.update(&deleted, book.version).await.unwrap();

        assert!(store.get(book.id).await.unwrap().is_none());
        assert!(store.find_by_isbn("i-1").await.unwrap().is_none());
        // The row itself survives for outstanding consumers.
        assert_eq!(store.raw_len(), 1);
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = InMemoryBookStore::new();
        store.insert(&sample("i-1", BookCategory::Fiction)).await.unwrap();
        store.insert(&sample("i-2", BookCategory::Fiction)).await.unwrap();
        store.insert(&sample("i-3", BookCategory::Science)).await.unwrap();

        let page = store
            .list(&ListQuery {
                category: Some(BookCategory::Fiction),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.books.len(), 2);

        let paged = store
            .list(&ListQuery {
                limit: 2,
                page: 2,
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.total, 3);
        assert_eq!(paged.books.len(), 1);
        assert_eq!(paged.total_pages(), 2);

        let by_status = store
            .list(&ListQuery {
                status: Some(BookStatus::Maintenance),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_status.total, 0);
    }
}
