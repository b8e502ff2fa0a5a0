//! Distributed mutual exclusion keyed by resource identifier.
//!
//! A [`LockManager`] coordinates N independent [`LockStore`]s: a lease is
//! held only while a strict majority of stores agree, within one attempt
//! round. Leases expire on their own; holders of long-running work extend
//! before expiry or lose the key to the next caller.
//!
//! The manager does not fence writes itself. Each [`Lease`] carries a
//! fencing token (monotonic across successive holders of a key, given a
//! non-Byzantine majority) for callers that talk to fencing-aware
//! downstreams; everyone else re-validates an expected version at commit.

mod manager;
mod store;

pub use manager::{Lease, LockConfig, LockError, LockManager};
pub use store::{InMemoryLockStore, LockStore, LockStoreError};
