//! Inventory consistency core.
//!
//! [`BookService`] orchestrates the component crates to perform safe
//! read-modify-write cycles on book records: acquire the record's lock, read
//! current state (cache first, store fallback), apply the pure transition,
//! persist under an optimistic version check, invalidate caches, publish the
//! change event, release the lock.
//!
//! The store is the single source of truth. Cache and event-publish
//! failures are absorbed here and logged; lock and store failures surface
//! through the [`ServiceError`] taxonomy.

pub mod config;
mod error;
mod keys;
mod propagator;
mod service;


pub use config::Config;
pub use error::ServiceError;
pub use propagator::EventPropagator;
pub use service::BookService;
