//! HTTP adapter: axum middleware and the reference server.

mod middleware;
mod server;

pub use middleware::{
    denial_response, describe_request, AuthenticatedUser, ClientIp, RateLimitLayer,
    RateLimitMiddleware, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
    X_RATELIMIT_TYPE,
};
pub use server::HttpServer;
