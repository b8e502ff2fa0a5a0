//! Postgres-backed book store (sqlx).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

use circulation_core::{Book, BookCategory, BookId, BookStatus};

use super::{BookPage, BookStore, ListQuery, StoreError};

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Clone)]
pub struct PostgresBookStore {
    pool: PgPool,
}

impl PostgresBookStore {
    /// Connect a new store client.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the books table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS books (
                id              UUID PRIMARY KEY,
                title           TEXT NOT NULL,
                author          TEXT NOT NULL,
                isbn            TEXT NOT NULL,
                publisher       TEXT NULL,
                published_year  INT NULL,
                category        TEXT NOT NULL,
                total_copies    INT NOT NULL,
                available_copies INT NOT NULL,
                status          TEXT NOT NULL,
                version         BIGINT NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL,
                deleted         BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to create books table: {}", e)))?;

        // Live records keep ISBNs unique; soft-deleted rows release theirs.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS books_isbn_live
            ON books (isbn) WHERE NOT deleted
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to create isbn index: {}", e)))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS books_category_status
            ON books (category, status) WHERE NOT deleted
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("failed to create listing index: {}", e)))?;

        Ok(())
    }

    fn row_to_book(row: &PgRow) -> Result<Book, StoreError> {
        let backend = |e: sqlx::Error| StoreError::Backend(e.to_string());

        let id: Uuid = row.try_get("id").map_err(backend)?;
        let category: String = row.try_get("category").map_err(backend)?;
        let status: String = row.try_get("status").map_err(backend)?;
        let total_copies: i32 = row.try_get("total_copies").map_err(backend)?;
        let available_copies: i32 = row.try_get("available_copies").map_err(backend)?;
        let version: i64 = row.try_get("version").map_err(backend)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(backend)?;
        let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(backend)?;

        Ok(Book {
            id: BookId::from_uuid(id),
            title: row.try_get("title").map_err(backend)?,
            author: row.try_get("author").map_err(backend)?,
            isbn: row.try_get("isbn").map_err(backend)?,
            publisher: row.try_get("publisher").map_err(backend)?,
            published_year: row.try_get("published_year").map_err(backend)?,
            category: BookCategory::parse(&category)
                .ok_or_else(|| StoreError::Backend(format!("unknown category: {}", category)))?,
            total_copies: total_copies as u32,
            available_copies: available_copies as u32,
            status: BookStatus::parse(&status)
                .ok_or_else(|| StoreError::Backend(format!("unknown status: {}", status)))?,
            version: version as u64,
            created_at,
            updated_at,
            deleted: row.try_get("deleted").map_err(backend)?,
        })
    }

    fn push_filters(qb: &mut QueryBuilder<'_, sqlx::Postgres>, query: &ListQuery) {
        if let Some(category) = query.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        if let Some(author) = &query.author {
            qb.push(" AND author ILIKE ")
                .push_bind(format!("%{}%", author));
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
    }
}

#[async_trait]
impl BookStore for PostgresBookStore {
    async fn insert(&self, book: &Book) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO books (
                id, title, author, isbn, publisher, published_year, category,
                total_copies, available_copies, status, version,
                created_at, updated_at, deleted
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(book.id.as_uuid())
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.isbn)
        .bind(&book.publisher)
        .bind(book.published_year)
        .bind(book.category.as_str())
        .bind(book.total_copies as i32)
        .bind(book.available_copies as i32)
        .bind(book.status.as_str())
        .bind(book.version as i64)
        .bind(book.created_at)
        .bind(book.updated_at)
        .bind(book.deleted)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let is_duplicate = err
                    .as_database_error()
                    .and_then(|db| db.code())
                    .map(|code| code == UNIQUE_VIOLATION)
                    .unwrap_or(false);
                if is_duplicate {
                    Err(StoreError::DuplicateIsbn(book.isbn.clone()))
                } else {
                    Err(StoreError::Backend(format!("insert failed: {}", err)))
                }
            }
        }
    }

    async fn get(&self, id: BookId) -> Result<Option<Book>, StoreError> {
        let row = sqlx::query("SELECT * FROM books WHERE id = $1 AND NOT deleted")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("get failed: {}", e)))?;

        row.as_ref().map(Self::row_to_book).transpose()
    }

    async fn find_by_isbn(&self, isbn: &str) -> Result<Option<Book>, StoreError> {
        let row = sqlx::query("SELECT * FROM books WHERE isbn = $1 AND NOT deleted")
            .bind(isbn)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("find_by_isbn failed: {}", e)))?;

        row.as_ref().map(Self::row_to_book).transpose()
    }

    async fn update(&self, book: &Book, expected_version: u64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE books SET
                title = $3, author = $4, publisher = $5, published_year = $6,
                category = $7, total_copies = $8, available_copies = $9,
                status = $10, version = $11, updated_at = $12, deleted = $13
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(book.id.as_uuid())
        .bind(expected_version as i64)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.publisher)
        .bind(book.published_year)
        .bind(book.category.as_str())
        .bind(book.total_copies as i32)
        .bind(book.available_copies as i32)
        .bind(book.status.as_str())
        .bind(book.version as i64)
        .bind(book.updated_at)
        .bind(book.deleted)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("update failed: {}", e)))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Zero rows: either the record is gone or someone got there first.
        let current: Option<i64> = sqlx::query_scalar("SELECT version FROM books WHERE id = $1")
            .bind(book.id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("version probe failed: {}", e)))?;

        match current {
            None => Err(StoreError::NotFound),
            Some(found) => Err(StoreError::VersionConflict(format!(
                "expected version {}, found {}",
                expected_version, found
            ))),
        }
    }

    async fn list(&self, query: &ListQuery) -> Result<BookPage, StoreError> {
        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM books WHERE NOT deleted");
        Self::push_filters(&mut count_qb, query);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("count failed: {}", e)))?;

        let mut qb = QueryBuilder::new("SELECT * FROM books WHERE NOT deleted");
        Self::push_filters(&mut qb, query);
        qb.push(" ORDER BY created_at, id");
        qb.push(" LIMIT ").push_bind(i64::from(query.limit));
        qb.push(" OFFSET ").push_bind(query.offset() as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("list failed: {}", e)))?;

        let books = rows
            .iter()
            .map(Self::row_to_book)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BookPage {
            books,
            total: total as u64,
            page: query.page,
            limit: query.limit,
        })
    }
}
