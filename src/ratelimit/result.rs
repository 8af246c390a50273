//! Evaluation results and the response headers derived from them.

use serde::Serialize;
use std::collections::BTreeMap;

use super::policy::RateLimitConfig;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Header name to value, in a stable order.
pub type RateLimitHeaders = BTreeMap<&'static str, String>;

/// Outcome of a single rate limit evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the request is admitted
    pub success: bool,
    /// The configured maximum for the window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends (epoch milliseconds)
    pub reset_at: u64,
    /// Seconds to wait before retrying; only set on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// Build the result for a counter that has reached `count`.
    pub(crate) fn from_count(
        config: &RateLimitConfig,
        count: u64,
        reset_at: u64,
        retry_after_secs: u64,
    ) -> Self {
        let success = count <= config.max_requests();
        Self::build(config, success, count, reset_at, retry_after_secs)
    }

    /// Build a read-only status: `success` reports whether one more request
    /// would still be admitted.
    pub(crate) fn peek(
        config: &RateLimitConfig,
        count: u64,
        reset_at: u64,
        retry_after_secs: u64,
    ) -> Self {
        let success = count < config.max_requests();
        Self::build(config, success, count, reset_at, retry_after_secs)
    }

    fn build(
        config: &RateLimitConfig,
        success: bool,
        count: u64,
        reset_at: u64,
        retry_after_secs: u64,
    ) -> Self {
        Self {
            success,
            limit: config.max_requests(),
            remaining: config.max_requests().saturating_sub(count),
            reset_at,
            retry_after: (!success).then(|| retry_after_secs.max(1)),
        }
    }

    /// Response headers for this result.
    pub fn headers(&self) -> RateLimitHeaders {
        create_rate_limit_headers(self)
    }
}

/// Convert a result into standard rate limit response headers.
///
/// `Retry-After` is present only when the result carries a retry hint.
pub fn create_rate_limit_headers(result: &RateLimitResult) -> RateLimitHeaders {
    let mut headers = RateLimitHeaders::new();
    headers.insert(HEADER_LIMIT, result.limit.to_string());
    headers.insert(HEADER_REMAINING, result.remaining.to_string());
    headers.insert(HEADER_RESET, result.reset_at.div_ceil(1000).to_string());
    if let Some(retry_after) = result.retry_after {
        headers.insert(HEADER_RETRY_AFTER, retry_after.to_string());
    }
    headers
}
