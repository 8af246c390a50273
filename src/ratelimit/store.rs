//! Distributed counter store abstraction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StoreBackend, StoreConfig};
use crate::mesh::{Cluster, MeshCounterStore};

use super::redis_store::RedisCounterStore;

/// Errors raised by a distributed counter store.
///
/// The evaluator never surfaces these; any of them triggers the local
/// fallback.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation failed: {0}")]
    Backend(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Remaining lifetime of a stored counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Expires in this many seconds
    Expires(u64),
    /// Exists but has no expiry
    Persistent,
    /// No such key
    Missing,
}

impl Ttl {
    /// Decode a Redis-style TTL reply (`-2` missing, `-1` no expiry).
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            -2 => Ttl::Missing,
            n if n < 0 => Ttl::Persistent,
            n => Ttl::Expires(n as u64),
        }
    }

    /// Seconds left, if a positive expiry is set.
    pub fn seconds(&self) -> Option<u64> {
        match *self {
            Ttl::Expires(secs) if secs > 0 => Some(secs),
            _ => None,
        }
    }
}

/// Capability surface required from a shared counter store.
///
/// Implementations must make `increment` atomic across every process
/// sharing the store; the evaluator performs no locking of its own on this
/// path.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Atomically add one and return the new value, creating the key at 1.
    async fn increment(&self, key: &str) -> StoreResult<u64>;

    /// Set or refresh the key's expiry. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool>;

    /// Remaining lifetime of the key.
    async fn ttl(&self, key: &str) -> StoreResult<Ttl>;

    /// Current value without incrementing.
    async fn get(&self, key: &str) -> StoreResult<Option<u64>>;
}

/// A connected distributed store.
///
/// Keeps the mesh cluster reachable so the owner can sweep its counters and
/// shut it down; the store itself only exposes [`CounterStore`].
pub struct ConnectedStore {
    pub store: Arc<dyn CounterStore>,
    pub cluster: Option<Arc<Cluster>>,
}

impl ConnectedStore {
    fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            cluster: None,
        }
    }
}

/// Build the configured distributed store.
///
/// Returns `None` when no backend is configured or the backend cannot be
/// reached; callers treat that exactly like a failing store.
pub async fn connect_store(config: &StoreConfig) -> Option<Arc<dyn CounterStore>> {
    open_store(config).await.map(|connected| connected.store)
}

/// Like [`connect_store`], but also hands back the mesh cluster, if any.
pub async fn open_store(config: &StoreConfig) -> Option<ConnectedStore> {
    match config.backend {
        StoreBackend::None => {
            info!("No distributed store configured, using in-process counters only");
            None
        }
        StoreBackend::Redis => {
            let timeout = Duration::from_millis(config.connect_timeout_ms);
            match RedisCounterStore::connect(&config.redis_url, timeout).await {
                Ok(store) => {
                    info!("Connected to Redis counter store");
                    Some(ConnectedStore::new(Arc::new(store)))
                }
                Err(e) => {
                    warn!(error = %e, "Redis counter store unavailable, falling back to in-process counters");
                    None
                }
            }
        }
        StoreBackend::Mesh => match Cluster::start(config.mesh.to_cluster_config()).await {
            Ok(cluster) => {
                let cluster = Arc::new(cluster);
                Some(ConnectedStore {
                    store: Arc::new(MeshCounterStore::new(cluster.clone())),
                    cluster: Some(cluster),
                })
            }
            Err(e) => {
                warn!(error = %e, "Mesh counter store unavailable, falling back to in-process counters");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_from_raw() {
        assert_eq!(Ttl::from_raw(-2), Ttl::Missing);
        assert_eq!(Ttl::from_raw(-1), Ttl::Persistent);
        assert_eq!(Ttl::from_raw(0), Ttl::Expires(0));
        assert_eq!(Ttl::from_raw(42), Ttl::Expires(42));
    }

    #[test]
    fn test_ttl_seconds() {
        assert_eq!(Ttl::Expires(5).seconds(), Some(5));
        assert_eq!(Ttl::Expires(0).seconds(), None);
        assert_eq!(Ttl::Persistent.seconds(), None);
        assert_eq!(Ttl::Missing.seconds(), None);
    }

    #[tokio::test]
    async fn test_connect_without_backend() {
        let config = StoreConfig::default();
        assert!(connect_store(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_connect_bad_redis_url_degrades() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: "not a url".to_string(),
            connect_timeout_ms: 100,
            ..StoreConfig::default()
        };
        assert!(connect_store(&config).await.is_none());
    }

    #[tokio::test]
    async fn test_open_mesh_store_keeps_cluster() {
        let addr: std::net::SocketAddr = ([127, 0, 0, 1], 17951).into();
        let mut config = StoreConfig {
            backend: StoreBackend::Mesh,
            ..StoreConfig::default()
        };
        config.mesh.node_id = Some("open-store-node".to_string());
        config.mesh.listen_addr = addr;

        let connected = open_store(&config).await.unwrap();
        assert_eq!(connected.store.name(), "mesh");
        let cluster = connected.cluster.unwrap();
        assert_eq!(cluster.node_id(), "open-store-node");

        drop(connected.store);
        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
