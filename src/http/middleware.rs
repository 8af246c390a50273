//! Rate limit middleware for axum routers.
//!
//! ```ignore
//! let state = RateLimitLayerState::new(limiter, Policy::Api.config());
//! let app = Router::new()
//!     .route("/v1/evidence", post(upload))
//!     .layer(axum::middleware::from_fn_with_state(state, enforce_rate_limit));
//! ```

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::warn;

use super::response::{rate_limited_response, to_header_map};
use crate::ratelimit::{RateLimitConfig, RateLimitResult, RateLimiter};

/// Header carrying the authenticated user id, set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Identifier used when no client address header is present.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Middleware state: the shared limiter and the policy guarding this router.
#[derive(Clone)]
pub struct RateLimitLayerState {
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<RateLimitConfig>,
}

impl RateLimitLayerState {
    pub fn new(limiter: Arc<RateLimiter>, config: RateLimitConfig) -> Self {
        Self {
            limiter,
            config: Arc::new(config),
        }
    }
}

/// Resolve the client address from proxy headers.
///
/// Checks `X-Forwarded-For` (first entry), then `X-Real-IP`, then
/// `CF-Connecting-IP`.
pub fn client_identifier(headers: &HeaderMap) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header_value("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    header_value("x-real-ip")
        .or_else(|| header_value("cf-connecting-ip"))
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

/// The authenticated user id, if the request carries one.
pub fn user_identifier(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Record a blocked request.
pub(crate) fn log_block_event(
    config: &RateLimitConfig,
    result: &RateLimitResult,
    identifier: &str,
    user_id: Option<&str>,
    endpoint: &str,
    user_agent: Option<&str>,
) {
    warn!(
        identifier = %identifier,
        endpoint = %endpoint,
        key_prefix = %config.key_prefix(),
        request_count = config.max_requests(),
        window_start = result.reset_at.saturating_sub(config.window_ms()),
        user_id = user_id.unwrap_or_default(),
        user_agent = user_agent.unwrap_or_default(),
        blocked = true,
        "Rate limit exceeded"
    );
}

/// Reject requests over the configured limit with 429, and decorate
/// admitted responses with rate limit headers.
pub async fn enforce_rate_limit(
    State(state): State<RateLimitLayerState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let identifier = client_identifier(req.headers());
    let user_id = user_identifier(req.headers());

    let result = state
        .limiter
        .check_rate_limit(&state.config, &identifier, user_id.as_deref())
        .await;
    let rate_headers = result.headers();

    if !result.success {
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok());
        log_block_event(
            &state.config,
            &result,
            &identifier,
            user_id.as_deref(),
            req.uri().path(),
            user_agent,
        );
        return rate_limited_response("Too many requests. Please try again later.", &rate_headers);
    }

    let mut response = next.run(req).await;
    response.headers_mut().extend(to_header_map(&rate_headers));
    response
}
