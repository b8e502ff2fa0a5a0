//! Cache and lock key derivation.
//!
//! Keys are deterministic functions of the record id or the query
//! parameters, so invalidation can target one detail entry or the whole
//! listing family by prefix.

use circulation_core::BookId;
use circulation_infra::ListQuery;

/// Prefix shared by every cached listing.
pub const LIST_PREFIX: &str = "books:list:";

pub fn detail(id: BookId) -> String {
    format!("book:{}", id)
}

pub fn list(query: &ListQuery) -> String {
    format!(
        "{}category={};author={};status={};page={};limit={}",
        LIST_PREFIX,
        query.category.map(|c| c.as_str()).unwrap_or("-"),
        query.author.as_deref().unwrap_or("-"),
        query.status.map(|s| s.as_str()).unwrap_or("-"),
        query.page,
        query.limit,
    )
}

pub fn lock(id: BookId) -> String {
    format!("lock:book:{}", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use circulation_core::BookCategory;

    #[test]
    fn list_keys_are_deterministic_per_query() {
        let a = ListQuery {
            category: Some(BookCategory::Science),
            ..ListQuery::default()
        };
        let b = ListQuery {
            category: Some(BookCategory::Science),
            ..ListQuery::default()
        };
        assert_eq!(list(&a), list(&b));
        assert_ne!(list(&a), list(&ListQuery::default()));
        assert!(list(&a).starts_with(LIST_PREFIX));
    }
}
