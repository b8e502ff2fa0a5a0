//! Single Redis lock store: one voter in the quorum.
//!
//! Acquisition is SET NX PX plus a per-key INCR fencing counter; release and
//! extend compare the holder token server-side so a stale holder can never
//! free or prolong someone else's lease.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use circulation_lock::{LockStore, LockStoreError};

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("pexpire", KEYS[1], ARGV[2])
else
  return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockStoreError::Backend(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| LockStoreError::Backend(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn fence_key(key: &str) -> String {
        format!("{}:fence", key)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<Option<u64>, LockStoreError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Backend(format!("SET NX failed: {}", e)))?;

        if set.is_none() {
            return Ok(None);
        }

        let fence: u64 = redis::cmd("INCR")
            .arg(Self::fence_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Backend(format!("INCR failed: {}", e)))?;
        Ok(Some(fence))
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(token)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Backend(format!("release EVAL failed: {}", e)))?;
        Ok(removed == 1)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let extended: i64 = redis::cmd("EVAL")
            .arg(EXTEND_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Backend(format!("extend EVAL failed: {}", e)))?;
        Ok(extended == 1)
    }
}
