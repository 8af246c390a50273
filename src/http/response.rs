//! Response helpers shared by the service routes and the middleware.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ratelimit::RateLimitHeaders;

/// Error code sent with 429 responses.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
/// Error code sent with 400 responses.
pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    code: &'a str,
}

/// Convert rate limit headers into an HTTP header map.
pub fn to_header_map(headers: &RateLimitHeaders) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        // Names are fixed ASCII tokens and values are decimal integers
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

/// Build a 429 JSON response carrying the rate limit headers.
pub fn rate_limited_response(message: &str, headers: &RateLimitHeaders) -> Response {
    let body = ErrorBody {
        error: message,
        code: RATE_LIMIT_EXCEEDED,
    };
    (StatusCode::TOO_MANY_REQUESTS, to_header_map(headers), Json(body)).into_response()
}

/// Build a 400 JSON response.
pub fn invalid_argument(message: &str) -> Response {
    let body = ErrorBody {
        error: message,
        code: INVALID_ARGUMENT,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}
