//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and state gossip for shared rate limit counters.
//!
//! Every node publishes only its own contribution to a counter, as
//! `count|expires_at_ms` under `rl|<key>` in its node state. The value of a
//! counter is the sum of the unexpired contributions of all live nodes.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use thiserror::Error;
use tracing::{debug, info};

use crate::ratelimit::Ttl;

/// Prefix for counter keys in node state.
const KEY_PREFIX: &str = "rl|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "formaos-ratelimit".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// One node's contribution to a counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests counted by this node in the current window
    pub count: u64,
    /// Window deadline (epoch ms); 0 means no expiry set yet
    pub expires_at: u64,
}

impl CounterEntry {
    /// Encode as a node state value.
    /// Format: "{count}|{expires_at}"
    pub fn encode(&self) -> String {
        format!("{}|{}", self.count, self.expires_at)
    }

    /// Parse a node state value.
    pub fn decode(value: &str) -> Option<Self> {
        let (count, expires_at) = value.split_once('|')?;
        Some(Self {
            count: count.parse().ok()?,
            expires_at: expires_at.parse().ok()?,
        })
    }

    /// Whether this contribution still belongs to the current window.
    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at == 0 || self.expires_at > now
    }
}

/// Aggregate view of a counter across live nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CounterView {
    total: u64,
    /// Latest deadline among live contributions (0 if none has one)
    latest_expiry: u64,
    /// Whether any live node holds a contribution
    present: bool,
}

fn state_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add `amount` to our contribution and return the cluster-wide total.
    ///
    /// A stale contribution from a previous window is dropped first. A
    /// contribution without a deadline adopts the latest live deadline seen
    /// in the cluster, so all nodes close the window together.
    pub async fn increment_counter(&self, key: &str, amount: u64, now: u64) -> u64 {
        let state_key = state_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let view = Self::view(&chitchat, &state_key, now);

        let mut own = chitchat
            .self_node_state()
            .get(&state_key)
            .and_then(CounterEntry::decode)
            .filter(|entry| entry.is_live(now))
            .unwrap_or_default();

        let previous = own.count;
        if own.expires_at == 0 {
            own.expires_at = view.latest_expiry;
        }
        own.count += amount;
        chitchat.self_node_state().set(&state_key, own.encode());

        debug!(
            key = %state_key,
            local_value = own.count,
            "Incremented local counter"
        );

        // A stale contribution was filtered out above, so `previous` is
        // exactly what the view already counted for us
        view.total - previous + own.count
    }

    /// Set the deadline of our contribution to `now + seconds`.
    ///
    /// Returns `false` when no live node holds the counter.
    pub async fn expire_counter(&self, key: &str, seconds: u64, now: u64) -> bool {
        let state_key = state_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        if !Self::view(&chitchat, &state_key, now).present {
            return false;
        }

        let mut own = chitchat
            .self_node_state()
            .get(&state_key)
            .and_then(CounterEntry::decode)
            .filter(|entry| entry.is_live(now))
            .unwrap_or_default();
        own.expires_at = now + seconds * 1000;
        chitchat.self_node_state().set(&state_key, own.encode());
        true
    }

    /// Remaining lifetime of a counter, derived from the latest live deadline.
    pub async fn counter_ttl(&self, key: &str, now: u64) -> Ttl {
        let state_key = state_key(key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        let view = Self::view(&chitchat, &state_key, now);
        if !view.present {
            Ttl::Missing
        } else if view.latest_expiry == 0 {
            Ttl::Persistent
        } else {
            Ttl::Expires((view.latest_expiry - now).div_ceil(1000))
        }
    }

    /// Get the total count for a key across all nodes.
    pub async fn get_count(&self, key: &str, now: u64) -> u64 {
        let state_key = state_key(key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Self::view(&chitchat, &state_key, now).total
    }

    /// Delete this node's contributions whose window has ended.
    ///
    /// Chitchat tombstones deleted keys and drops them from gossip after
    /// the grace period. Returns how many counters were removed.
    pub async fn purge_expired_counters(&self, now: u64) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let state = chitchat.self_node_state();

        let stale: Vec<String> = state
            .iter_prefix(KEY_PREFIX)
            .filter(|(_, versioned)| {
                CounterEntry::decode(&versioned.value).map_or(true, |entry| !entry.is_live(now))
            })
            .map(|(key, _)| key.to_string())
            .collect();

        for key in &stale {
            state.delete(key);
        }

        if !stale.is_empty() {
            debug!(removed = stale.len(), "Purged expired mesh counters");
        }
        stale.len()
    }

    /// Number of counters this node currently publishes.
    pub async fn local_counter_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat.self_node_state().iter_prefix(KEY_PREFIX).count()
    }

    /// Sum live contributions for a key across all live nodes.
    fn view(chitchat: &chitchat::Chitchat, state_key: &str, now: u64) -> CounterView {
        let mut view = CounterView::default();

        for node_id in chitchat.live_nodes() {
            let Some(entry) = chitchat
                .node_state(node_id)
                .and_then(|state| state.get(state_key))
                .and_then(CounterEntry::decode)
            else {
                continue;
            };

            if entry.is_live(now) && entry.count > 0 {
                view.total += entry.count;
                view.latest_expiry = view.latest_expiry.max(entry.expires_at);
                view.present = true;
            }
        }

        view
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
