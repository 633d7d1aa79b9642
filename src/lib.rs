//! Collopi Limiter - request-scoped adaptive rate limiting
//!
//! This crate implements the rate limiter guarding the Collopi collaboration
//! platform's expensive routes. Callers are counted per route in fixed
//! windows, keyed by client address or, on authentication-aware routes, by
//! user id with a separate (usually higher) ceiling.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
