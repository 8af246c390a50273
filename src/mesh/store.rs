//! Counter store backed by the gossip mesh.

use async_trait::async_trait;
use std::sync::Arc;

use super::cluster::Cluster;
use crate::ratelimit::{CounterStore, StoreResult, Ttl};

/// A [`CounterStore`] whose counters live in cluster node state.
///
/// Increments are atomic per node; the cluster-wide value converges as
/// state gossips, so concurrent bursts on different nodes may briefly
/// over-admit.
#[derive(Debug, Clone)]
pub struct MeshCounterStore {
    cluster: Arc<Cluster>,
}

impl MeshCounterStore {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Drop this node's counters whose window has ended.
    pub async fn purge_expired(&self) -> usize {
        self.cluster
            .purge_expired_counters(crate::ratelimit::now_ms())
            .await
    }
}

#[async_trait]
impl CounterStore for MeshCounterStore {
    fn name(&self) -> &'static str {
        "mesh"
    }

    async fn increment(&self, key: &str) -> StoreResult<u64> {
        Ok(self.cluster.increment_counter(key, 1, crate::ratelimit::now_ms()).await)
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        Ok(self.cluster.expire_counter(key, seconds, crate::ratelimit::now_ms()).await)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Ttl> {
        Ok(self.cluster.counter_ttl(key, crate::ratelimit::now_ms()).await)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<u64>> {
        let count = self.cluster.get_count(key, crate::ratelimit::now_ms()).await;
        Ok((count > 0).then_some(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use crate::ratelimit::{LocalCounterStore, RateLimitConfig, RateLimiter};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_mesh_store_operations() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18946)).await.unwrap());

        {
            let store = MeshCounterStore::new(cluster.clone());
            assert_eq!(store.get("k").await.unwrap(), None);
            assert_eq!(store.increment("k").await.unwrap(), 1);
            assert_eq!(store.ttl("k").await.unwrap(), Ttl::Persistent);
            assert!(store.expire("k", 30).await.unwrap());
            assert!(matches!(store.ttl("k").await.unwrap(), Ttl::Expires(29..=30)));
            assert_eq!(store.increment("k").await.unwrap(), 2);
            assert_eq!(store.get("k").await.unwrap(), Some(2));

            // Live windows survive a purge
            assert_eq!(store.purge_expired().await, 0);
            assert_eq!(store.get("k").await.unwrap(), Some(2));
        }

        // Cleanup - store dropped, so we can unwrap
        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_limiter_over_mesh() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18947)).await.unwrap());

        {
            let store = Arc::new(MeshCounterStore::new(cluster.clone()));
            let local = Arc::new(LocalCounterStore::new());
            let limiter = RateLimiter::with_store(store, local.clone());
            let config = RateLimitConfig::from_millis(10_000, 5, "rl:mesh").unwrap();

            for i in 1..=5 {
                let result = limiter.check_rate_limit(&config, "10.1.1.1", None).await;
                assert!(result.success, "Request {} should be admitted", i);
                assert_eq!(result.remaining, 5 - i);
            }

            let result = limiter.check_rate_limit(&config, "10.1.1.1", None).await;
            assert!(!result.success);
            assert!(result.retry_after.unwrap() <= 10);
            assert!(local.is_empty());
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
