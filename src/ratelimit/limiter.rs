//! Core rate limiter: fixed-window evaluation with distributed-store
//! preference and in-process fallback.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::key::RateLimitKey;
use super::local::LocalCounterStore;
use super::now_ms;
use super::policy::RateLimitConfig;
use super::result::RateLimitResult;
use super::store::{CounterStore, StoreError, StoreResult, Ttl};

/// Default bound on one distributed check, covering every round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// Default minimum gap between two fail-open warnings for the same scope.
pub const DEFAULT_WARNING_COOLDOWN: Duration = Duration::from_secs(60);

/// Why a check was answered from the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallbackReason {
    StoreUnavailable,
    StoreError,
}

impl FallbackReason {
    fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::StoreUnavailable => "store_unavailable",
            FallbackReason::StoreError => "store_error",
        }
    }
}

/// The rate limit evaluator.
///
/// Prefers the shared store so quotas hold across instances; whenever that
/// store is missing, errors, or is too slow, the check is answered from the
/// process-local store instead. Callers only ever see a [`RateLimitResult`].
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Shared store, if one is configured and reachable
    distributed: Option<Arc<dyn CounterStore>>,
    /// Process-wide fallback counters
    local: Arc<LocalCounterStore>,
    /// Upper bound for one distributed check
    store_timeout: Duration,
    /// Minimum gap between fail-open warnings per scope
    warning_cooldown: Duration,
    /// Last fail-open warning per `<key_prefix>:<reason>` (epoch ms)
    last_warning_at: DashMap<String, u64>,
}

impl RateLimiter {
    /// Create a limiter that only uses in-process counters.
    pub fn new(local: Arc<LocalCounterStore>) -> Self {
        Self {
            distributed: None,
            local,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            warning_cooldown: DEFAULT_WARNING_COOLDOWN,
            last_warning_at: DashMap::new(),
        }
    }

    /// Create a limiter that prefers `store` and falls back to `local`.
    pub fn with_store(store: Arc<dyn CounterStore>, local: Arc<LocalCounterStore>) -> Self {
        Self {
            distributed: Some(store),
            ..Self::new(local)
        }
    }

    /// Create a limiter from the result of [`connect_store`](super::connect_store).
    pub fn from_parts(store: Option<Arc<dyn CounterStore>>, local: Arc<LocalCounterStore>) -> Self {
        match store {
            Some(store) => Self::with_store(store, local),
            None => Self::new(local),
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_warning_cooldown(mut self, cooldown: Duration) -> Self {
        self.warning_cooldown = cooldown;
        self
    }

    /// The fallback store.
    pub fn local_store(&self) -> &Arc<LocalCounterStore> {
        &self.local
    }

    pub fn has_distributed_store(&self) -> bool {
        self.distributed.is_some()
    }

    /// Count one request for `(ip, user_id)` under `config` and decide
    /// whether it is admitted.
    pub async fn check_rate_limit(
        &self,
        config: &RateLimitConfig,
        ip: &str,
        user_id: Option<&str>,
    ) -> RateLimitResult {
        let key = RateLimitKey::new(config, ip, user_id);

        trace!(key = %key, "Checking rate limit");

        let reason = match &self.distributed {
            Some(store) => {
                match self.bounded(self.check_distributed(store.as_ref(), config, &key)).await {
                    Ok(result) => {
                        self.log_denial(&key, &result);
                        return result;
                    }
                    Err(e) => {
                        debug!(key = %key, store = store.name(), error = %e, "Distributed check failed");
                        FallbackReason::StoreError
                    }
                }
            }
            None => FallbackReason::StoreUnavailable,
        };

        self.warn_fail_open(config, reason, ip, user_id);

        let result = self.check_local(config, &key);
        self.log_denial(&key, &result);
        result
    }

    /// Report the current state for `(ip, user_id)` without counting a request.
    pub async fn get_rate_limit_status(
        &self,
        config: &RateLimitConfig,
        ip: &str,
        user_id: Option<&str>,
    ) -> RateLimitResult {
        let key = RateLimitKey::new(config, ip, user_id);

        if let Some(store) = &self.distributed {
            match self.bounded(self.status_distributed(store.as_ref(), config, &key)).await {
                Ok(result) => return result,
                Err(e) => {
                    debug!(key = %key, store = store.name(), error = %e, "Distributed status read failed");
                }
            }
        }

        self.status_local(config, &key)
    }

    /// Run a store operation under the configured timeout.
    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        tokio::time::timeout(self.store_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }

    async fn check_distributed(
        &self,
        store: &dyn CounterStore,
        config: &RateLimitConfig,
        key: &RateLimitKey,
    ) -> StoreResult<RateLimitResult> {
        let window_secs = config.window_secs();

        let count = store.increment(key.as_str()).await?;

        // Arm the window on the first hit, and re-arm keys that lost their
        // TTL. `Expires(0)` is a live key in its last half second.
        let mut ttl = if count == 1 {
            Ttl::Missing
        } else {
            store.ttl(key.as_str()).await?
        };
        if matches!(ttl, Ttl::Persistent | Ttl::Missing) {
            store.expire(key.as_str(), window_secs).await?;
            ttl = store.ttl(key.as_str()).await?;
        }

        let ttl_secs = ttl.seconds().unwrap_or(window_secs);
        let reset_at = now_ms() + ttl_secs * 1000;

        trace!(key = %key, count, ttl_secs, "Distributed counter updated");

        Ok(RateLimitResult::from_count(config, count, reset_at, ttl_secs))
    }

    fn check_local(&self, config: &RateLimitConfig, key: &RateLimitKey) -> RateLimitResult {
        let record = self.local.hit(key.as_str(), config.window());
        let retry_after = record.secs_until_reset(now_ms());
        RateLimitResult::from_count(config, record.count, record.reset_at, retry_after)
    }

    async fn status_distributed(
        &self,
        store: &dyn CounterStore,
        config: &RateLimitConfig,
        key: &RateLimitKey,
    ) -> StoreResult<RateLimitResult> {
        let window_secs = config.window_secs();

        let (count, ttl) = futures::try_join!(store.get(key.as_str()), store.ttl(key.as_str()))?;

        let count = count.unwrap_or(0);
        let ttl_secs = ttl.seconds().unwrap_or(window_secs);
        let reset_at = now_ms() + ttl_secs * 1000;

        Ok(RateLimitResult::peek(config, count, reset_at, ttl_secs))
    }

    fn status_local(&self, config: &RateLimitConfig, key: &RateLimitKey) -> RateLimitResult {
        let now = now_ms();
        match self.local.peek(key.as_str()) {
            Some(record) => RateLimitResult::peek(
                config,
                record.count,
                record.reset_at,
                record.secs_until_reset(now),
            ),
            None => RateLimitResult::peek(config, 0, now + config.window_ms(), config.window_secs()),
        }
    }

    fn log_denial(&self, key: &RateLimitKey, result: &RateLimitResult) {
        if !result.success {
            debug!(
                key = %key,
                limit = result.limit,
                retry_after = result.retry_after,
                "Rate limit exceeded"
            );
        }
    }

    /// Emit a fail-open warning at most once per scope per cooldown.
    fn warn_fail_open(
        &self,
        config: &RateLimitConfig,
        reason: FallbackReason,
        identifier: &str,
        user_id: Option<&str>,
    ) {
        let scope = format!("{}:{}", config.key_prefix(), reason.as_str());
        let now = now_ms();
        let cooldown_ms = self.warning_cooldown.as_millis() as u64;

        let mut should_warn = false;
        self.last_warning_at
            .entry(scope)
            .and_modify(|last| {
                if now.saturating_sub(*last) >= cooldown_ms {
                    *last = now;
                    should_warn = true;
                }
            })
            .or_insert_with(|| {
                should_warn = true;
                now
            });

        if should_warn {
            warn!(
                reason = reason.as_str(),
                key_prefix = %config.key_prefix(),
                identifier = %identifier,
                user_id = user_id.unwrap_or_default(),
                "Rate limiter answering from in-process counters"
            );
        }
    }

    /// Number of fail-open scopes seen so far.
    #[cfg(test)]
    fn warning_scopes(&self) -> usize {
        self.last_warning_at.len()
    }
}
