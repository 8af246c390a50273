//! Configuration management for the rate limit service.
//!
//! Sources are layered: built-in defaults, then an optional file, then
//! `FORMAOS__SECTION__FIELD` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{FormaError, Result};
use crate::mesh::ClusterConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FORMAOS";

/// Main configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormaConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Distributed store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Evaluator and policy configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Which shared store backs the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process counters only
    #[default]
    None,
    /// A Redis-compatible server
    Redis,
    /// The gossip mesh
    Mesh,
}

/// Distributed store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// How long to wait for the initial store connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Mesh settings, used when `backend` is `mesh`
    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            mesh: MeshConfig::default(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

/// Gossip mesh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier; a random one is generated when unset
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
        }
    }
}

impl MeshConfig {
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "formaos-ratelimit".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

/// Evaluator and policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Upper bound for one distributed check in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Minimum gap between fail-open warnings per policy and reason
    #[serde(default = "default_warning_cooldown")]
    pub fail_open_warning_cooldown_ms: u64,

    /// How often to sweep expired in-process counters (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Path to a YAML policy file overriding the built-ins
    #[serde(default)]
    pub policies_path: Option<String>,

    /// How often to reload the policy file (0 disables)
    #[serde(default = "default_reload_interval")]
    pub policy_reload_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout(),
            fail_open_warning_cooldown_ms: default_warning_cooldown(),
            sweep_interval_secs: default_sweep_interval(),
            policies_path: None,
            policy_reload_interval_secs: default_reload_interval(),
        }
    }
}

impl LimiterConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn warning_cooldown(&self) -> Duration {
        Duration::from_millis(self.fail_open_warning_cooldown_ms)
    }
}

fn default_store_timeout() -> u64 {
    250
}

fn default_warning_cooldown() -> u64 {
    60_000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_reload_interval() -> u64 {
    60
}

impl FormaConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("store.mesh.seed_nodes"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(FormaError::Config(
                "store.redis_url is required when store.backend is redis".to_string(),
            ));
        }
        if self.store.backend != StoreBackend::None && self.limiter.store_timeout_ms == 0 {
            return Err(FormaError::Config(
                "limiter.store_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Mesh && self.store.mesh.cluster_id.trim().is_empty() {
            return Err(FormaError::Config(
                "store.mesh.cluster_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
