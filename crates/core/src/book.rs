use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::BookId;

/// Availability lifecycle of a book record.
///
/// `Available` and `Unavailable` are derived from the copy counts;
/// `Maintenance` is operator-set and is never overridden by the derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookStatus {
    Available,
    Unavailable,
    Maintenance,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Available => "available",
            BookStatus::Unavailable => "unavailable",
            BookStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(BookStatus::Available),
            "unavailable" => Some(BookStatus::Unavailable),
            "maintenance" => Some(BookStatus::Maintenance),
            _ => None,
        }
    }
}

impl core::fmt::Display for BookStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BookCategory {
    Fiction,
    NonFiction,
    Science,
    Technology,
    History,
    Biography,
    #[default]
    Other,
}

impl BookCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookCategory::Fiction => "fiction",
            BookCategory::NonFiction => "non_fiction",
            BookCategory::Science => "science",
            BookCategory::Technology => "technology",
            BookCategory::History => "history",
            BookCategory::Biography => "biography",
            BookCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fiction" => Some(BookCategory::Fiction),
            "non_fiction" => Some(BookCategory::NonFiction),
            "science" => Some(BookCategory::Science),
            "technology" => Some(BookCategory::Technology),
            "history" => Some(BookCategory::History),
            "biography" => Some(BookCategory::Biography),
            "other" => Some(BookCategory::Other),
            _ => None,
        }
    }
}

/// A book record: the shared, finite-inventory unit the service coordinates.
///
/// Invariants maintained by the transition functions below:
/// - `0 <= available_copies <= total_copies`
/// - `version` strictly increases with every produced state
/// - derived status never overrides operator-set `Maintenance`
///
/// Mutations go through [`Book::with_copy_delta`] / [`Book::with_patch`] /
/// [`Book::with_deleted`], which return the next state and leave the input
/// untouched. The store persists a state only when the record's `version`
/// still matches the one the transition started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub publisher: Option<String>,
    pub published_year: Option<i32>,
    pub category: BookCategory,
    pub total_copies: u32,
    pub available_copies: u32,
    pub status: BookStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; deleted records are invisible to reads but the
    /// row survives for outstanding event consumers.
    pub deleted: bool,
}

/// Input for creating a book record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub publisher: Option<String>,
    pub published_year: Option<i32>,
    #[serde(default)]
    pub category: BookCategory,
    pub total_copies: u32,
    /// Starts equal to `total_copies` when absent.
    pub available_copies: Option<u32>,
}

/// Partial update of a book's metadata and capacity.
///
/// `available_copies` is deliberately absent: the available count only moves
/// through [`Book::with_copy_delta`], or through the clamp applied when
/// `total_copies` shrinks below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookPatch {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub published_year: Option<i32>,
    pub category: Option<BookCategory>,
    pub total_copies: Option<u32>,
    /// Operator-set status (enter or leave `Maintenance`). Available vs
    /// Unavailable is still derived from the resulting counts.
    pub status: Option<BookStatus>,
}

impl BookPatch {
    pub fn is_empty(&self) -> bool {
        self == &BookPatch::default()
    }
}

impl Book {
    /// Create a fresh record from validated input.
    pub fn create(id: BookId, new: NewBook, now: DateTime<Utc>) -> DomainResult<Self> {
        if new.title.trim().is_empty() {
            return Err(DomainError::validation("title cannot be empty"));
        }
        if new.author.trim().is_empty() {
            return Err(DomainError::validation("author cannot be empty"));
        }
        if new.isbn.trim().is_empty() {
            return Err(DomainError::validation("isbn cannot be empty"));
        }

        let available = new.available_copies.unwrap_or(new.total_copies);
        if available > new.total_copies {
            return Err(DomainError::validation(format!(
                "available_copies {} exceeds total_copies {}",
                available, new.total_copies
            )));
        }

        Ok(Self {
            id,
            title: new.title.trim().to_string(),
            author: new.author.trim().to_string(),
            isbn: new.isbn.trim().to_string(),
            publisher: new.publisher,
            published_year: new.published_year,
            category: new.category,
            total_copies: new.total_copies,
            available_copies: available,
            status: derive_status(BookStatus::Available, available),
            version: 1,
            created_at: now,
            updated_at: now,
            deleted: false,
        })
    }

    pub fn can_be_borrowed(&self) -> bool {
        self.available_copies > 0 && self.status == BookStatus::Available && !self.deleted
    }

    /// Apply a copy-count delta (negative = borrow, positive = return) and
    /// return the next state.
    ///
    /// - Going below zero fails with [`DomainError::OutOfStock`] without
    ///   producing a state.
    /// - Exceeding `total_copies` clamps: an over-return is a benign
    ///   recording error, not a failure.
    /// - A record in `Maintenance` rejects the change unless
    ///   `operator_override` is set; the status stays `Maintenance` either
    ///   way.
    pub fn with_copy_delta(
        &self,
        delta: i64,
        operator_override: bool,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }
        if self.status == BookStatus::Maintenance && !operator_override {
            return Err(DomainError::invalid_transition(
                "book is under maintenance",
            ));
        }

        let current = i64::from(self.available_copies);
        let next = current + delta;
        if next < 0 {
            return Err(DomainError::OutOfStock);
        }
        let next = (next as u64).min(u64::from(self.total_copies)) as u32;

        let mut book = self.clone();
        book.available_copies = next;
        book.status = derive_status(self.status, next);
        book.version = self.version + 1;
        book.updated_at = now;
        Ok(book)
    }

    /// Apply a metadata/capacity patch and return the next state.
    ///
    /// Shrinking `total_copies` below the current available count clamps
    /// `available_copies` down to the new total.
    pub fn with_patch(&self, patch: &BookPatch, now: DateTime<Utc>) -> DomainResult<Self> {
        if patch.is_empty() {
            return Err(DomainError::validation("empty patch"));
        }

        let mut book = self.clone();

        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(DomainError::validation("title cannot be empty"));
            }
            book.title = title.trim().to_string();
        }
        if let Some(author) = &patch.author {
            if author.trim().is_empty() {
                return Err(DomainError::validation("author cannot be empty"));
            }
            book.author = author.trim().to_string();
        }
        if let Some(publisher) = &patch.publisher {
            book.publisher = Some(publisher.clone());
        }
        if let Some(year) = patch.published_year {
            book.published_year = Some(year);
        }
        if let Some(category) = patch.category {
            book.category = category;
        }
        if let Some(total) = patch.total_copies {
            book.total_copies = total;
            book.available_copies = book.available_copies.min(total);
        }
        if let Some(status) = patch.status {
            book.status = status;
        }

        book.status = derive_status(book.status, book.available_copies);
        book.version = self.version + 1;
        book.updated_at = now;
        Ok(book)
    }

    /// Mark the record soft-deleted.
    pub fn with_deleted(&self, now: DateTime<Utc>) -> Self {
        let mut book = self.clone();
        book.deleted = true;
        book.version = self.version + 1;
        book.updated_at = now;
        book
    }

    /// Field names that differ between `self` and `other`.
    ///
    /// Used to build the changed-field list on `Updated` events.
    pub fn changed_fields(&self, other: &Book) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title != other.title {
            fields.push("title");
        }
        if self.author != other.author {
            fields.push("author");
        }
        if self.publisher != other.publisher {
            fields.push("publisher");
        }
        if self.published_year != other.published_year {
            fields.push("published_year");
        }
        if self.category != other.category {
            fields.push("category");
        }
        if self.total_copies != other.total_copies {
            fields.push("total_copies");
        }
        if self.available_copies != other.available_copies {
            fields.push("available_copies");
        }
        if self.status != other.status {
            fields.push("status");
        }
        if self.deleted != other.deleted {
            fields.push("deleted");
        }
        fields
    }
}

/// Recompute Available/Unavailable from the copy count.
///
/// Operator-set `Maintenance` is sticky: the derivation never leaves it.
fn derive_status(current: BookStatus, available: u32) -> BookStatus {
    if current == BookStatus::Maintenance {
        BookStatus::Maintenance
    } else if available == 0 {
        BookStatus::Unavailable
    } else {
        BookStatus::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn sample_book(total: u32, available: u32) -> Book {
        Book::create(
            BookId::new(),
            NewBook {
                title: "The Design of Everyday Things".to_string(),
                author: "Don Norman".to_string(),
                isbn: "978-0465050659".to_string(),
                publisher: None,
                published_year: Some(1988),
                category: BookCategory::NonFiction,
                total_copies: total,
                available_copies: Some(available),
            },
            test_time(),
        )
        .unwrap()
    }

    #[test]
    fn create_rejects_blank_title() {
        let err = Book::create(
            BookId::new(),
            NewBook {
                title: "   ".to_string(),
                author: "A".to_string(),
                isbn: "isbn".to_string(),
                publisher: None,
                published_year: None,
                category: BookCategory::Other,
                total_copies: 1,
                available_copies: None,
            },
            test_time(),
        )
        .unwrap_err();
        match err {
            DomainError::Validation(_) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn create_with_zero_copies_starts_unavailable() {
        let book = sample_book(0, 0);
        assert_eq!(book.status, BookStatus::Unavailable);
        assert!(!book.can_be_borrowed());
    }

    #[test]
    fn borrow_decrements_and_marks_unavailable_at_zero() {
        let book = sample_book(3, 3);

        let book = book.with_copy_delta(-1, false, test_time()).unwrap();
        let book = book.with_copy_delta(-1, false, test_time()).unwrap();
        let book = book.with_copy_delta(-1, false, test_time()).unwrap();

        assert_eq!(book.available_copies, 0);
        assert_eq!(book.status, BookStatus::Unavailable);

        let book = book.with_copy_delta(1, false, test_time()).unwrap();
        assert_eq!(book.available_copies, 1);
        assert_eq!(book.status, BookStatus::Available);
    }

    #[test]
    fn borrow_below_zero_is_out_of_stock() {
        let book = sample_book(1, 0);
        let err = book.with_copy_delta(-1, false, test_time()).unwrap_err();
        assert_eq!(err, DomainError::OutOfStock);
        // The failed transition produced no state: the input is untouched.
        assert_eq!(book.available_copies, 0);
    }

    #[test]
    fn over_return_clamps_to_total() {
        let book = sample_book(2, 2);
        let book = book.with_copy_delta(1, false, test_time()).unwrap();
        assert_eq!(book.available_copies, 2);
        assert_eq!(book.status, BookStatus::Available);
    }

    #[test]
    fn maintenance_blocks_changes_without_override() {
        let mut book = sample_book(2, 2);
        book.status = BookStatus::Maintenance;

        let err = book.with_copy_delta(-1, false, test_time()).unwrap_err();
        match err {
            DomainError::InvalidTransition(_) => {}
            other => panic!("expected InvalidTransition, got {other:?}"),
        }

        // Operator override applies the delta but keeps Maintenance.
        let next = book.with_copy_delta(-1, true, test_time()).unwrap();
        assert_eq!(next.available_copies, 1);
        assert_eq!(next.status, BookStatus::Maintenance);
    }

    #[test]
    fn zero_delta_is_rejected() {
        let book = sample_book(1, 1);
        let err = book.with_copy_delta(0, false, test_time()).unwrap_err();
        match err {
            DomainError::Validation(_) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn shrinking_total_clamps_available() {
        let book = sample_book(5, 4);
        let patch = BookPatch {
            total_copies: Some(2),
            ..BookPatch::default()
        };
        let next = book.with_patch(&patch, test_time()).unwrap();
        assert_eq!(next.total_copies, 2);
        assert_eq!(next.available_copies, 2);
        assert_eq!(next.status, BookStatus::Available);
    }

    #[test]
    fn shrinking_total_to_zero_forces_unavailable() {
        let book = sample_book(5, 4);
        let patch = BookPatch {
            total_copies: Some(0),
            ..BookPatch::default()
        };
        let next = book.with_patch(&patch, test_time()).unwrap();
        assert_eq!(next.available_copies, 0);
        assert_eq!(next.status, BookStatus::Unavailable);
    }

    #[test]
    fn leaving_maintenance_rederives_status() {
        let mut book = sample_book(2, 0);
        book.status = BookStatus::Maintenance;

        let patch = BookPatch {
            status: Some(BookStatus::Available),
            ..BookPatch::default()
        };
        let next = book.with_patch(&patch, test_time()).unwrap();
        // Zero copies: the explicit Available is corrected to Unavailable.
        assert_eq!(next.status, BookStatus::Unavailable);
    }

    #[test]
    fn every_transition_bumps_version() {
        let book = sample_book(2, 2);
        assert_eq!(book.version, 1);

        let borrowed = book.with_copy_delta(-1, false, test_time()).unwrap();
        assert_eq!(borrowed.version, 2);

        let patched = borrowed
            .with_patch(
                &BookPatch {
                    title: Some("Renamed".to_string()),
                    ..BookPatch::default()
                },
                test_time(),
            )
            .unwrap();
        assert_eq!(patched.version, 3);

        let deleted = patched.with_deleted(test_time());
        assert_eq!(deleted.version, 4);
        assert!(deleted.deleted);
    }

    #[test]
    fn changed_fields_reports_copy_change() {
        let book = sample_book(1, 1);
        let next = book.with_copy_delta(-1, false, test_time()).unwrap();
        let fields = book.changed_fields(&next);
        assert!(fields.contains(&"available_copies"));
        assert!(fields.contains(&"status"));
        assert!(!fields.contains(&"title"));
    }

    proptest! {
        /// For any sequence of borrow/return deltas, every successfully
        /// produced state satisfies `0 <= available <= total`, and the
        /// status derivation matches the counts.
        #[test]
        fn copy_invariants_hold_over_any_delta_sequence(
            total in 0u32..8,
            deltas in proptest::collection::vec(-3i64..=3i64, 0..32),
        ) {
            let mut book = sample_book(total, total);
            for delta in deltas {
                match book.with_copy_delta(delta, false, test_time()) {
                    Ok(next) => {
                        prop_assert!(next.available_copies <= next.total_copies);
                        prop_assert!(next.version == book.version + 1);
                        if next.available_copies == 0 {
                            prop_assert_eq!(next.status, BookStatus::Unavailable);
                        } else {
                            prop_assert_eq!(next.status, BookStatus::Available);
                        }
                        book = next;
                    }
                    Err(DomainError::OutOfStock) => {
                        prop_assert!(i64::from(book.available_copies) + delta < 0);
                    }
                    Err(DomainError::Validation(_)) => {
                        prop_assert_eq!(delta, 0);
                    }
                    Err(other) => return Err(TestCaseError::fail(format!("{other:?}"))),
                }
            }
        }
    }
}
