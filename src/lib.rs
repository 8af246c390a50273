//! FormaOS rate limiter.
//!
//! Fixed-window request rate limiting with a shared counter store
//! (Redis-compatible or a peer gossip mesh) and an in-process fallback that
//! takes over whenever the shared store is absent, failing or slow. The
//! crate can be linked directly through [`ratelimit::RateLimiter`] and the
//! axum middleware in [`http`], or run as a standalone decision service.

pub mod background;
pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod ratelimit;
