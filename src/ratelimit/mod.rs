//! Rate limiting logic and state management.

mod key;
mod limiter;
mod local;
mod policy;
mod redis_store;
mod result;
mod store;

pub use key::RateLimitKey;
pub use limiter::{RateLimiter, DEFAULT_STORE_TIMEOUT, DEFAULT_WARNING_COOLDOWN};
pub use local::{CounterRecord, LocalCounterStore};
pub use policy::{Policy, PolicyRegistry, PolicySet, RateLimitConfig};
pub use redis_store::RedisCounterStore;
pub use result::{
    create_rate_limit_headers, RateLimitHeaders, RateLimitResult, HEADER_LIMIT,
    HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use store::{connect_store, open_store, ConnectedStore, CounterStore, StoreError, StoreResult, Ttl};

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
