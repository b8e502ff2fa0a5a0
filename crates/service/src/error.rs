//! Service error taxonomy.

use thiserror::Error;

use circulation_breaker::BreakerError;
use circulation_core::DomainError;
use circulation_infra::StoreError;
use circulation_lock::LockError;

/// What the request-handling layer sees.
///
/// Retry guidance: `Conflict` and `Unavailable` are retryable (the latter
/// only after backoff); the domain-rule and `NotFound` variants are
/// terminal.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Another writer holds the record (lock contention or a stale
    /// version). Retry with backoff, not in a tight loop.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The borrow would drive available copies below zero.
    #[error("out of stock")]
    OutOfStock,

    /// The requested state change is not legal from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A domain invariant rejected the input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No such record.
    #[error("not found")]
    NotFound,

    /// A required dependency is down or its breaker is open.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::OutOfStock => ServiceError::OutOfStock,
            DomainError::InvalidTransition(msg) => ServiceError::InvalidTransition(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                ServiceError::Validation(msg)
            }
            DomainError::NotFound => ServiceError::NotFound,
            DomainError::Conflict(msg) => ServiceError::Conflict(msg),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::VersionConflict(msg) => ServiceError::Conflict(msg),
            StoreError::DuplicateIsbn(isbn) => {
                ServiceError::Conflict(format!("isbn already exists: {}", isbn))
            }
            StoreError::Backend(msg) => ServiceError::Unavailable(msg),
        }
    }
}

impl From<LockError> for ServiceError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Contention(key) => {
                ServiceError::Conflict(format!("record is locked: {}", key))
            }
            LockError::NotExtended(key) => {
                ServiceError::Conflict(format!("lease lost for: {}", key))
            }
            LockError::Store(err) => ServiceError::Unavailable(err.to_string()),
        }
    }
}

impl<E> From<BreakerError<E>> for ServiceError
where
    E: Into<ServiceError> + std::error::Error,
{
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Rejected => {
                ServiceError::Unavailable("circuit open: dependency calls rejected".to_string())
            }
            BreakerError::Timeout => {
                ServiceError::Unavailable("dependency call timed out".to_string())
            }
            BreakerError::Inner(inner) => inner.into(),
        }
    }
}
