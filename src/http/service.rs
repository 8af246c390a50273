//! Rate limit decision service.
//!
//! Lets other services ask for a decision over HTTP instead of linking the
//! limiter in-process.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::middleware::log_block_event;
use super::response::{invalid_argument, rate_limited_response, to_header_map};
use crate::ratelimit::{PolicyRegistry, RateLimitConfig, RateLimiter};

/// Shared state for the decision routes.
#[derive(Clone)]
pub struct AppState {
    /// The rate limiter instance
    pub limiter: Arc<RateLimiter>,
    /// Named policies
    pub policies: Arc<PolicyRegistry>,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>, policies: Arc<PolicyRegistry>) -> Self {
        Self { limiter, policies }
    }
}

/// Body of a check request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckRequest {
    /// Policy name, e.g. `auth` or `api`
    pub policy: String,
    /// Client address or other caller identity
    pub identifier: String,
    /// Authenticated user, if any
    #[serde(default)]
    pub user_id: Option<String>,
    /// Path being guarded, for the block log
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Query of a status request.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    pub policy: String,
    pub identifier: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    distributed_store: bool,
}

/// Build the decision service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ratelimit/check", post(check))
        .route("/v1/ratelimit/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

/// Validate a request and resolve its policy.
fn resolve(state: &AppState, policy: &str, identifier: &str) -> Result<RateLimitConfig, Response> {
    if identifier.trim().is_empty() {
        warn!("Received rate limit request with empty identifier");
        return Err(invalid_argument("identifier is required"));
    }

    state.policies.get(policy).ok_or_else(|| {
        warn!(policy = %policy, "Received rate limit request for unknown policy");
        invalid_argument(&format!("unknown policy '{}'", policy))
    })
}

/// Count one request and return the decision.
#[instrument(skip(state, headers, req), fields(policy = %req.policy))]
async fn check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CheckRequest>,
) -> Response {
    let config = match resolve(&state, &req.policy, &req.identifier) {
        Ok(config) => config,
        Err(response) => return response,
    };

    let user_id = req.user_id.as_deref().filter(|u| !u.is_empty());
    let result = state
        .limiter
        .check_rate_limit(&config, &req.identifier, user_id)
        .await;
    let rate_headers = result.headers();

    if !result.success {
        log_block_event(
            &config,
            &result,
            &req.identifier,
            user_id,
            req.endpoint.as_deref().unwrap_or_default(),
            headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok()),
        );
        return rate_limited_response("Too many requests. Please try again later.", &rate_headers);
    }

    debug!(remaining = result.remaining, "Rate limit decision made");

    (StatusCode::OK, to_header_map(&rate_headers), Json(result)).into_response()
}

/// Report the current state without counting a request.
async fn status(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> Response {
    let config = match resolve(&state, &query.policy, &query.identifier) {
        Ok(config) => config,
        Err(response) => return response,
    };

    let user_id = query.user_id.as_deref().filter(|u| !u.is_empty());
    let result = state
        .limiter
        .get_rate_limit_status(&config, &query.identifier, user_id)
        .await;

    (StatusCode::OK, to_header_map(&result.headers()), Json(result)).into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        distributed_store: state.limiter.has_distributed_store(),
    })
}

/// Log the routes being served.
pub(crate) fn log_routes() {
    info!(
        routes = "POST /v1/ratelimit/check, GET /v1/ratelimit/status, GET /health",
        "Rate limit service routes registered"
    );
}
