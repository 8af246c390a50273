//! HTTP surface: the decision service and the axum middleware.

mod middleware;
mod response;
mod server;
mod service;

pub use middleware::{
    client_identifier, enforce_rate_limit, user_identifier, RateLimitLayerState, UNKNOWN_CLIENT,
    USER_ID_HEADER,
};
pub use response::{
    invalid_argument, rate_limited_response, to_header_map, INVALID_ARGUMENT, RATE_LIMIT_EXCEEDED,
};
pub use server::HttpServer;
pub use service::{router, AppState, CheckRequest, StatusQuery};
