//! Tollgate - In-process HTTP Rate Limiting
//!
//! This crate implements token-bucket admission control for HTTP services.
//! Requests are keyed by client address, path, method, basic-auth user and
//! selected header values; each key gets its own bucket that refills at the
//! configured rate and is dropped after sitting idle.
//!
//! State is kept in process: every instance limits on its own, so a fleet of
//! N instances admits up to N times the configured rate.
//!
//! Requests whose identity cannot be determined (no resolvable address and no
//! allow-listed user or header) are let through rather than lumped into a
//! shared bucket.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollgate::http::RateLimitLayer;
//! use tollgate::ratelimit::Limiter;
//!
//! # fn main() -> tollgate::error::Result<()> {
//! let limiter = Arc::new(Limiter::new(5.0)?);
//! limiter.set_methods(["POST", "PUT"]).set_header("X-API-Key", ["gold"]);
//! let router: axum::Router = axum::Router::new().layer(RateLimitLayer::new(limiter));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
