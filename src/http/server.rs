//! HTTP server hosting rate limited routes.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{MatchedPath, State};
use axum::http::Method;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, info};

use super::middleware::RateLimitLayer;
use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    spawn_sweeper, validate_route_policies, MemoryStore, PolicyEvaluator, RateLimitStore,
    RoutePolicy,
};

/// Routes the server always mounts without a policy.
const RESERVED_ROUTES: &[&str] = &["/health", "/stats"];

/// HTTP server exposing each configured route behind its rate limit policy.
pub struct HttpServer<S: RateLimitStore + ?Sized + 'static = MemoryStore> {
    /// Address to bind to
    addr: SocketAddr,
    /// Evaluator shared by every protected route
    evaluator: Arc<PolicyEvaluator<S>>,
    /// Protected routes and their policies
    policies: Vec<RoutePolicy>,
    /// How often the store is swept
    sweep_interval: Duration,
}

impl<S: RateLimitStore + ?Sized + 'static> HttpServer<S> {
    /// Create a new HTTP server.
    pub fn new(
        addr: SocketAddr,
        evaluator: Arc<PolicyEvaluator<S>>,
        policies: Vec<RoutePolicy>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            addr,
            evaluator,
            policies,
            sweep_interval,
        }
    }

    /// Build the application router.
    ///
    /// Fails if any policy is invalid, a route is bound twice, a route
    /// claims a reserved path, or the router rejects a route as conflicting.
    pub fn router(&self) -> Result<Router> {
        validate_route_policies(&self.policies)?;

        let mut router: Router = Router::new()
            .route("/health", get(health))
            .route("/stats", get(stats::<S>))
            .with_state(Arc::clone(&self.evaluator));

        for route_policy in &self.policies {
            if RESERVED_ROUTES.contains(&route_policy.route.as_str()) {
                return Err(LimiterError::Config(format!(
                    "route '{}' is reserved",
                    route_policy.route
                )));
            }

            let layer = RateLimitLayer::new(Arc::clone(&self.evaluator), route_policy.policy.clone())?;
            info!(
                route = %route_policy.route,
                window_ms = route_policy.policy.window_ms,
                max = route_policy.policy.max,
                authenticated_max = ?route_policy.policy.authenticated_max,
                "Protecting route"
            );

            // axum panics on conflicting routes
            let handler = get(protected).post(protected).route_layer(layer);
            let path = route_policy.route.as_str();
            router = panic::catch_unwind(AssertUnwindSafe(move || router.route(path, handler)))
                .map_err(|_| {
                    LimiterError::Config(format!(
                        "route '{}' conflicts with another configured route",
                        route_policy.route
                    ))
                })?;
        }

        Ok(router)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The periodic sweeper runs for as long as the server does. The server
    /// shuts down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router()?;
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        let sweeper = spawn_sweeper(Arc::clone(self.evaluator.store()), self.sweep_interval);

        info!(
            addr = %self.addr,
            routes = self.policies.len(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "Starting HTTP server"
        );

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;

        sweeper.abort();

        result.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            LimiterError::Io(e)
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn stats<S: RateLimitStore + ?Sized + 'static>(
    State(evaluator): State<Arc<PolicyEvaluator<S>>>,
) -> Json<Value> {
    Json(json!({ "entries": evaluator.store().len() }))
}

async fn protected(method: Method, matched: MatchedPath) -> Json<Value> {
    Json(json!({
        "status": "success",
        "method": method.as_str(),
        "route": matched.as_str(),
    }))
}
