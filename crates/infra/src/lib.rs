//! Backend implementations: Redis cache, Redis lock stores, the two Redis
//! Streams event channels, and the authoritative book store (in-memory and
//! Postgres).
//!
//! Every client here is explicitly constructed and injected (init at
//! startup, scoped shutdown); nothing is an ambient singleton.

mod event_log;
mod redis_cache;
mod redis_lock;
mod stream_entry;
pub mod store;
mod work_queue;

pub use event_log::RedisEventLog;
pub use redis_cache::RedisCache;
pub use redis_lock::RedisLockStore;
pub use store::{BookPage, BookStore, InMemoryBookStore, ListQuery, PostgresBookStore, StoreError};
pub use work_queue::RedisWorkQueue;
