//! Rate limit policies: validated configurations and the named policy set.
//!
//! Each protected endpoint class (auth, api, uploads, ...) gets its own
//! [`RateLimitConfig`] with a distinct key prefix, so unrelated policies can
//! share a counter store without colliding. The built-in set can be
//! overridden from a YAML file.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{FormaError, Result};

/// Fixed-window limit for one class of endpoints.
///
/// Fields are private so that every instance has passed validation: the
/// window is non-zero and the key prefix is non-empty. `max_requests` may be
/// zero, which denies every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig", into = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    window: Duration,
    max_requests: u64,
    key_prefix: String,
}

/// Wire form of [`RateLimitConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRateLimitConfig {
    window_ms: u64,
    max_requests: u64,
    key_prefix: String,
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = FormaError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        RateLimitConfig::new(
            Duration::from_millis(raw.window_ms),
            raw.max_requests,
            raw.key_prefix,
        )
    }
}

impl From<RateLimitConfig> for RawRateLimitConfig {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            window_ms: config.window_ms(),
            max_requests: config.max_requests,
            key_prefix: config.key_prefix,
        }
    }
}

impl RateLimitConfig {
    /// Create a validated configuration.
    pub fn new(window: Duration, max_requests: u64, key_prefix: impl Into<String>) -> Result<Self> {
        let key_prefix = key_prefix.into();

        if window.as_millis() == 0 {
            return Err(FormaError::InvalidPolicy(format!(
                "window for '{}' must be at least 1ms",
                key_prefix
            )));
        }
        if key_prefix.trim().is_empty() {
            return Err(FormaError::InvalidPolicy(
                "key prefix must not be empty".to_string(),
            ));
        }

        Ok(Self {
            window,
            max_requests,
            key_prefix,
        })
    }

    /// Shorthand for a window expressed in milliseconds.
    pub fn from_millis(window_ms: u64, max_requests: u64, key_prefix: impl Into<String>) -> Result<Self> {
        Self::new(Duration::from_millis(window_ms), max_requests, key_prefix)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Window length rounded up to whole seconds, as used for store TTLs.
    pub fn window_secs(&self) -> u64 {
        self.window_ms().div_ceil(1000).max(1)
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }
}

/// The named policies shipped with FormaOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Sign-in, sign-up and password reset
    Auth,
    /// Authenticated API routes
    Api,
    /// Everything else
    General,
    /// File and evidence uploads
    Upload,
    /// Report and audit exports
    Export,
    /// Session heartbeats
    Heartbeat,
    /// Activity log writes
    Activity,
}

impl Policy {
    pub const ALL: [Policy; 7] = [
        Policy::Auth,
        Policy::Api,
        Policy::General,
        Policy::Upload,
        Policy::Export,
        Policy::Heartbeat,
        Policy::Activity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Auth => "auth",
            Policy::Api => "api",
            Policy::General => "general",
            Policy::Upload => "upload",
            Policy::Export => "export",
            Policy::Heartbeat => "heartbeat",
            Policy::Activity => "activity",
        }
    }

    /// Built-in configuration for this policy.
    pub fn config(&self) -> RateLimitConfig {
        let (window_secs, max_requests, key_prefix) = match self {
            Policy::Auth => (15 * 60, 10, "rl:auth"),
            Policy::Api => (60, 100, "rl:api"),
            Policy::General => (60, 200, "rl:gen"),
            Policy::Upload => (60, 20, "rl:upload"),
            Policy::Export => (10 * 60, 5, "rl:export"),
            // Event-driven heartbeats can cluster on focus/navigation
            Policy::Heartbeat => (60, 20, "rl:heartbeat"),
            Policy::Activity => (60, 20, "rl:activity"),
        };

        RateLimitConfig {
            window: Duration::from_secs(window_secs),
            max_requests,
            key_prefix: key_prefix.to_string(),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = FormaError;

    fn from_str(s: &str) -> Result<Self> {
        Policy::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FormaError::InvalidPolicy(format!("unknown policy '{}'", s)))
    }
}

/// Policies by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub policies: BTreeMap<String, RateLimitConfig>,
}

impl PolicySet {
    /// An empty set.
    pub fn new() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    /// The built-in FormaOS policies.
    pub fn builtin() -> Self {
        let policies = Policy::ALL
            .iter()
            .map(|p| (p.name().to_string(), p.config()))
            .collect();
        Self { policies }
    }

    /// Load policies from a YAML file, overlaid on the built-ins.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse policies from YAML, overlaid on the built-ins.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: PolicySet = serde_yaml::from_str(yaml)?;
        let mut set = Self::builtin();
        set.merge(overrides);
        set.validate()?;
        Ok(set)
    }

    /// Insert or replace every policy from `other`.
    pub fn merge(&mut self, other: PolicySet) {
        for (name, config) in other.policies {
            self.policies.insert(name.to_ascii_lowercase(), config);
        }
    }

    /// Reject sets where two policies would share counters.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (name, config) in &self.policies {
            if let Some(other) = seen.insert(config.key_prefix(), name) {
                return Err(FormaError::InvalidPolicy(format!(
                    "policies '{}' and '{}' share key prefix '{}'",
                    other,
                    name,
                    config.key_prefix()
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.policies.get(&name.trim().to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Shared, replaceable policy set.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    set: RwLock<PolicySet>,
}

impl PolicyRegistry {
    pub fn new(set: PolicySet) -> Self {
        Self {
            set: RwLock::new(set),
        }
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<RateLimitConfig> {
        self.set.read().get(name).cloned()
    }

    /// Swap in a freshly loaded set.
    pub fn replace(&self, set: PolicySet) {
        let mut current = self.set.write();
        *current = set;
    }

    /// Snapshot of the current set.
    pub fn snapshot(&self) -> PolicySet {
        self.set.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::from_millis(0, 10, "rl:x").is_err());
        assert!(RateLimitConfig::from_millis(1000, 10, "  ").is_err());

        // Zero requests is a deny-all policy, not a misconfiguration
        let deny_all = RateLimitConfig::from_millis(1000, 0, "rl:deny").unwrap();
        assert_eq!(deny_all.max_requests(), 0);
    }

    #[test]
    fn test_window_secs_rounds_up() {
        let config = RateLimitConfig::from_millis(50, 1, "rl:a").unwrap();
        assert_eq!(config.window_secs(), 1);

        let config = RateLimitConfig::from_millis(2500, 1, "rl:a").unwrap();
        assert_eq!(config.window_secs(), 3);

        assert_eq!(Policy::Auth.config().window_secs(), 900);
    }

    #[test]
    fn test_builtin_policies_have_distinct_prefixes() {
        let set = PolicySet::builtin();
        assert_eq!(set.len(), Policy::ALL.len());
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("auth".parse::<Policy>().unwrap(), Policy::Auth);
        assert_eq!(" Upload ".parse::<Policy>().unwrap(), Policy::Upload);
        assert!("nope".parse::<Policy>().is_err());
    }

    #[test]
    fn test_yaml_overlays_builtin() {
        let yaml = r#"
policies:
  auth:
    window_ms: 60000
    max_requests: 3
    key_prefix: "rl:auth"
  webhooks:
    window_ms: 1000
    max_requests: 50
    key_prefix: "rl:webhooks"
"#;
        let set = PolicySet::from_yaml(yaml).unwrap();

        let auth = set.get("auth").unwrap();
        assert_eq!(auth.max_requests(), 3);
        assert_eq!(auth.window(), Duration::from_secs(60));

        let webhooks = set.get("webhooks").unwrap();
        assert_eq!(webhooks.key_prefix(), "rl:webhooks");

        // Untouched built-ins survive
        assert_eq!(set.get("api"), Some(&Policy::Api.config()));
    }

    #[test]
    fn test_yaml_rejects_invalid_window() {
        let yaml = r#"
policies:
  broken:
    window_ms: 0
    max_requests: 3
    key_prefix: "rl:broken"
"#;
        assert!(PolicySet::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_yaml_rejects_shared_prefix() {
        let yaml = r#"
policies:
  login:
    window_ms: 1000
    max_requests: 3
    key_prefix: "rl:auth"
"#;
        let err = PolicySet::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("rl:auth"));
    }

    #[test]
    fn test_registry_replace() {
        let registry = PolicyRegistry::new(PolicySet::builtin());
        assert!(registry.get("auth").is_some());

        registry.replace(PolicySet::new());
        assert!(registry.get("auth").is_none());
        assert!(registry.snapshot().is_empty());
    }
}
