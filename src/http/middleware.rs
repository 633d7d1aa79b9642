//! Tower middleware applying a route policy to axum requests.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, MatchedPath, Request};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tower::{Layer, Service};

use crate::error::Result;
use crate::ratelimit::{
    format_reset_time, Decision, Denial, MemoryStore, PolicyConfig, PolicyEvaluator,
    RateLimitStore, RequestDescriptor, Scope,
};

/// Ceiling that applies to the caller.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// End of the current window, ISO-8601.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
/// Key scope, `ip` or `user`.
pub const X_RATELIMIT_TYPE: HeaderName = HeaderName::from_static("x-ratelimit-type");

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Client address resolved by an upstream, proxy-aware layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Verified user placed in request extensions by upstream authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
}

impl AuthenticatedUser {
    /// Wrap a verified user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Build the limiter's view of an HTTP request.
///
/// The route is the matched route template when axum has one, so requests
/// to `/users/1` and `/users/2` share the `/users/:id` counter.
pub fn describe_request<B>(req: &axum::http::Request<B>) -> RequestDescriptor {
    let extensions = req.extensions();

    let path = extensions
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    RequestDescriptor {
        method: req.method().to_string(),
        path,
        resolved_ip: extensions.get::<ClientIp>().map(|ip| ip.0.to_string()),
        socket_addr: extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string()),
        forwarded_for: req
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .map(String::from),
        authenticated_identity: extensions.get::<AuthenticatedUser>().map(|user| user.id.clone()),
    }
}

/// Layer that rate limits every request to the wrapped service with one
/// policy.
pub struct RateLimitLayer<S: RateLimitStore + ?Sized = MemoryStore> {
    evaluator: Arc<PolicyEvaluator<S>>,
    policy: Arc<PolicyConfig>,
}

impl<S: RateLimitStore + ?Sized> RateLimitLayer<S> {
    /// Bind `policy` to a route. Invalid policies are rejected here so a
    /// misconfigured route never starts unlimited.
    pub fn new(evaluator: Arc<PolicyEvaluator<S>>, policy: PolicyConfig) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            evaluator,
            policy: Arc::new(policy),
        })
    }

    /// The policy this layer enforces.
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }
}

impl<S: RateLimitStore + ?Sized> Clone for RateLimitLayer<S> {
    fn clone(&self) -> Self {
        Self {
            evaluator: Arc::clone(&self.evaluator),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<I, S: RateLimitStore + ?Sized> Layer<I> for RateLimitLayer<S> {
    type Service = RateLimitMiddleware<I, S>;

    fn layer(&self, inner: I) -> Self::Service {
        RateLimitMiddleware {
            inner,
            evaluator: Arc::clone(&self.evaluator),
            policy: Arc::clone(&self.policy),
        }
    }
}

/// Service produced by [`RateLimitLayer`]. Denied requests never reach the
/// inner service.
pub struct RateLimitMiddleware<I, S: RateLimitStore + ?Sized = MemoryStore> {
    inner: I,
    evaluator: Arc<PolicyEvaluator<S>>,
    policy: Arc<PolicyConfig>,
}

impl<I: Clone, S: RateLimitStore + ?Sized> Clone for RateLimitMiddleware<I, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            evaluator: Arc::clone(&self.evaluator),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<I, S> Service<Request> for RateLimitMiddleware<I, S>
where
    I: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    I::Future: Send + 'static,
    S: RateLimitStore + ?Sized + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Decide before yielding so lookup and increment stay one step.
        let descriptor = describe_request(&req);
        let decision = self.evaluator.evaluate(&descriptor, &self.policy, Utc::now());

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match decision {
                Decision::Allowed(status) => {
                    let mut response = inner.call(req).await?;
                    insert_rate_limit_headers(
                        response.headers_mut(),
                        status.limit,
                        status.remaining,
                        status.reset_time,
                        status.scope,
                    );
                    Ok(response)
                }
                Decision::Denied(denial) => Ok(denial_response(denial)),
            }
        })
    }
}

fn insert_rate_limit_headers(
    headers: &mut HeaderMap,
    limit: u64,
    remaining: u64,
    reset_time: DateTime<Utc>,
    scope: Scope,
) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    if let Ok(value) = HeaderValue::from_str(&format_reset_time(reset_time)) {
        headers.insert(X_RATELIMIT_RESET, value);
    }
    headers.insert(X_RATELIMIT_TYPE, HeaderValue::from_static(scope.as_str()));
}

/// Render a denial as a 429 with a JSON body.
pub fn denial_response(denial: Denial) -> Response {
    let mut headers = HeaderMap::new();
    insert_rate_limit_headers(
        &mut headers,
        denial.limit,
        denial.remaining,
        denial.reset_time,
        denial.rate_limit_type,
    );
    headers.insert(header::RETRY_AFTER, HeaderValue::from(denial.retry_after));

    (StatusCode::TOO_MANY_REQUESTS, headers, Json(denial)).into_response()
}
