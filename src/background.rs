//! Periodic maintenance tasks.
//!
//! The sweeper drops expired in-process counters so idle keys do not pile
//! up between probabilistic purges. The policy reloader re-reads the policy
//! file and swaps it into the registry; a file that fails to parse keeps
//! the previous set. The mesh sweeper deletes this node's ended counter
//! windows from gossip state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::mesh::MeshCounterStore;
use crate::ratelimit::{LocalCounterStore, PolicyRegistry, PolicySet};

/// Shortest period a task will tick at; `tokio::time::interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

fn ticks(period: Duration) -> IntervalStream {
    let mut interval = tokio::time::interval(period.max(MIN_PERIOD));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    IntervalStream::new(interval)
}

/// Spawn the expired-counter sweeper.
pub fn spawn_sweeper(local: Arc<LocalCounterStore>, period: Duration) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), "Starting local counter sweeper");

    tokio::spawn(async move {
        let mut ticks = ticks(period);
        while ticks.next().await.is_some() {
            let removed = local.purge_expired();
            debug!(removed, tracked = local.len(), "Local counter sweep complete");
        }
    })
}

/// Spawn the mesh counter sweeper.
pub fn spawn_mesh_sweeper(store: MeshCounterStore, period: Duration) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), "Starting mesh counter sweeper");

    tokio::spawn(async move {
        let mut ticks = ticks(period);
        while ticks.next().await.is_some() {
            store.purge_expired().await;
        }
    })
}

/// Reload the policy file once. Returns whether the registry changed.
pub fn reload_policies(registry: &PolicyRegistry, path: &Path) -> bool {
    match PolicySet::from_file(path) {
        Ok(set) => {
            if set == registry.snapshot() {
                return false;
            }
            info!(path = %path.display(), policies = set.len(), "Rate limit policies reloaded");
            registry.replace(set);
            true
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to reload rate limit policies, keeping previous set"
            );
            false
        }
    }
}

/// Spawn the policy file reloader.
pub fn spawn_policy_reload(
    registry: Arc<PolicyRegistry>,
    path: PathBuf,
    period: Duration,
) -> JoinHandle<()> {
    info!(path = %path.display(), period_secs = period.as_secs(), "Watching rate limit policy file");

    tokio::spawn(async move {
        // The first tick fires immediately and the file was just loaded
        let mut ticks = ticks(period).skip(1);
        while ticks.next().await.is_some() {
            reload_policies(&registry, &path);
        }
    })
}

/// Handles for the running maintenance tasks.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every task and wait for them to finish, so anything they hold
    /// is released when this returns.
    pub async fn shutdown(self) {
        let count = self.handles.len();
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task failed");
                }
            }
        }
        debug!(tasks = count, "Background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{CounterRecord, RateLimitConfig};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{}-{}.yaml", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired() {
        let local = Arc::new(LocalCounterStore::new());
        local.set("rl:test:1.1.1.1", CounterRecord { count: 3, reset_at: 1 });
        local.hit("rl:test:2.2.2.2", Duration::from_secs(60));

        let handle = spawn_sweeper(local.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(local.len(), 1);
        assert!(local.get("rl:test:2.2.2.2").is_some());
    }

    #[test]
    fn test_reload_policies() {
        let path = temp_path("policies");
        let registry = PolicyRegistry::new(PolicySet::builtin());

        std::fs::write(
            &path,
            "policies:\n  api:\n    window_ms: 1000\n    max_requests: 5\n    key_prefix: \"rl:api\"\n",
        )
        .unwrap();
        assert!(reload_policies(&registry, &path));
        assert_eq!(
            registry.get("api"),
            Some(RateLimitConfig::from_millis(1000, 5, "rl:api").unwrap())
        );

        // Unchanged file is a no-op
        assert!(!reload_policies(&registry, &path));

        // A broken file keeps the previous set
        std::fs::write(&path, "policies:\n  api:\n    window_ms: 0\n").unwrap();
        assert!(!reload_policies(&registry, &path));
        assert_eq!(registry.get("api").unwrap().max_requests(), 5);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_background_tasks_shutdown() {
        let mut tasks = BackgroundTasks::new();
        assert!(tasks.is_empty());

        tasks.push(spawn_sweeper(
            Arc::new(LocalCounterStore::new()),
            Duration::from_secs(60),
        ));
        assert_eq!(tasks.len(), 1);
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_period_does_not_panic() {
        let local = Arc::new(LocalCounterStore::new());
        local.set("rl:test:3.3.3.3", CounterRecord { count: 1, reset_at: 1 });

        let handle = spawn_sweeper(local.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();

        assert!(local.is_empty());
    }

    #[tokio::test]
    async fn test_mesh_sweeper_drops_ended_windows() {
        use crate::mesh::{Cluster, ClusterConfig};
        use crate::ratelimit::CounterStore;

        let addr: std::net::SocketAddr = ([127, 0, 0, 1], 17952).into();
        let cluster = Arc::new(
            Cluster::start(ClusterConfig {
                node_id: "sweeper-node".to_string(),
                listen_addr: addr,
                advertise_addr: addr,
                cluster_id: "test-cluster".to_string(),
                ..ClusterConfig::default()
            })
            .await
            .unwrap(),
        );

        let store = MeshCounterStore::new(cluster.clone());
        store.increment("short").await.unwrap();
        store.expire("short", 1).await.unwrap();
        store.increment("long").await.unwrap();
        store.expire("long", 60).await.unwrap();
        assert_eq!(cluster.local_counter_count().await, 2);

        let mut tasks = BackgroundTasks::new();
        tasks.push(spawn_mesh_sweeper(store, Duration::from_millis(50)));
        tokio::time::sleep(Duration::from_millis(1300)).await;

        assert_eq!(cluster.local_counter_count().await, 1);
        tasks.shutdown().await;

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
