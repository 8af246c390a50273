//! Redis-backed counter store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::trace;

use super::store::{CounterStore, StoreError, StoreResult, Ttl};

/// Counter store on a Redis-compatible server.
///
/// Uses INCR/EXPIRE/TTL/GET over a multiplexed connection that reconnects on
/// its own. Cloning the manager per call is cheap and lets concurrent checks
/// pipeline over the same socket.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Open a connection to `url`, giving up after `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid Redis URL: {}", e)))?;

        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn increment(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1u64).await?;
        trace!(key = %key, count, "INCR");
        Ok(count)
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let set: bool = conn.expire(key, seconds as i64).await?;
        Ok(set)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        let mut conn = self.conn.clone();
        let raw: i64 = conn.ttl(key).await?;
        Ok(Ttl::from_raw(raw))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(key).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let result = RedisCounterStore::connect("definitely not redis", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails() {
        // Port 1 on loopback is never a Redis server
        let result = RedisCounterStore::connect("redis://127.0.0.1:1/", Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
