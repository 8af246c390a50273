//! Counter key derivation.

use super::policy::RateLimitConfig;

/// A key that uniquely identifies one counter in a store.
///
/// Format: `<key_prefix>:<ip>[:<user_id>]`. Including the user id gives two
/// authenticated users behind the same address independent quotas.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Derive the key for a policy and caller identity.
    ///
    /// An empty user id is treated as absent.
    pub fn new(config: &RateLimitConfig, ip: &str, user_id: Option<&str>) -> Self {
        let key = match user_id.filter(|u| !u.is_empty()) {
            Some(user_id) => format!("{}:{}:{}", config.key_prefix(), ip, user_id),
            None => format!("{}:{}", config.key_prefix(), ip),
        };
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig::from_millis(1000, 5, "rl:api").unwrap()
    }

    #[test]
    fn test_key_without_user() {
        let key = RateLimitKey::new(&config(), "10.0.0.1", None);
        assert_eq!(key.as_str(), "rl:api:10.0.0.1");
    }

    #[test]
    fn test_key_with_user() {
        let key = RateLimitKey::new(&config(), "10.0.0.1", Some("user-42"));
        assert_eq!(key.to_string(), "rl:api:10.0.0.1:user-42");
    }

    #[test]
    fn test_empty_user_is_ignored() {
        let with_empty = RateLimitKey::new(&config(), "10.0.0.1", Some(""));
        let without = RateLimitKey::new(&config(), "10.0.0.1", None);
        assert_eq!(with_empty, without);
    }

    #[test]
    fn test_key_is_stable() {
        let key1 = RateLimitKey::new(&config(), "::1", Some("u"));
        let key2 = RateLimitKey::new(&config(), "::1", Some("u"));
        assert_eq!(key1, key2);
    }
}
