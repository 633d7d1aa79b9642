//! Per-route rate limit policies.
//!
//! A policy is supplied once when a route is registered and never changes
//! afterwards. Policies are validated up front so a bad configuration stops
//! the service at startup instead of silently leaving a route unlimited.

use std::collections::HashSet;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::key::Scope;
use crate::error::{LimiterError, Result};

/// Denial text for anonymous callers when the policy sets none.
pub const DEFAULT_MESSAGE: &str = "Too many requests from this IP, please try again later.";
/// Denial text for authenticated callers when the policy sets none.
pub const DEFAULT_AUTHENTICATED_MESSAGE: &str =
    "Too many requests for your account, please try again later.";
/// Longest window accepted, 100 years.
const MAX_WINDOW_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1_000;

/// Limits applied to one protected route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Ceiling for anonymous (IP keyed) callers
    pub max: u64,
    /// Ceiling for authenticated callers
    #[serde(default)]
    pub authenticated_max: Option<u64>,
    /// Key authenticated callers by user id. Defaults to on when
    /// `authenticated_max` is set.
    #[serde(default)]
    pub authentication_aware: Option<bool>,
    /// Denial text for anonymous callers
    #[serde(default)]
    pub message: Option<String>,
    /// Denial text for authenticated callers
    #[serde(default)]
    pub authenticated_message: Option<String>,
}

impl PolicyConfig {
    /// Create a policy allowing `max` requests per `window_ms`.
    pub fn new(window_ms: u64, max: u64) -> Self {
        Self {
            window_ms,
            max,
            authenticated_max: None,
            authentication_aware: None,
            message: None,
            authenticated_message: None,
        }
    }

    /// Set the ceiling for authenticated callers.
    pub fn with_authenticated_max(mut self, max: u64) -> Self {
        self.authenticated_max = Some(max);
        self
    }

    /// Force user keying on or off.
    pub fn with_authentication_aware(mut self, aware: bool) -> Self {
        self.authentication_aware = Some(aware);
        self
    }

    /// Set the denial text for anonymous callers.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the denial text for authenticated callers.
    pub fn with_authenticated_message(mut self, message: impl Into<String>) -> Self {
        self.authenticated_message = Some(message.into());
        self
    }

    /// Reject policies that would disable or break limiting.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(LimiterError::Config(
                "rate limit window_ms must be greater than zero".to_string(),
            ));
        }
        if self.window_ms > MAX_WINDOW_MS {
            return Err(LimiterError::Config(format!(
                "rate limit window_ms {} is out of range",
                self.window_ms
            )));
        }
        if self.max == 0 {
            return Err(LimiterError::Config(
                "rate limit max must be greater than zero".to_string(),
            ));
        }
        if self.authenticated_max == Some(0) {
            return Err(LimiterError::Config(
                "rate limit authenticated_max must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms as i64)
    }

    /// Whether authenticated callers get their own `user:` keyed counter.
    pub fn is_authentication_aware(&self) -> bool {
        self.authentication_aware
            .unwrap_or(self.authenticated_max.is_some())
    }

    /// Ceiling that applies to a key of the given scope.
    pub fn ceiling_for(&self, scope: Scope) -> u64 {
        match scope {
            Scope::User => self.authenticated_max.unwrap_or(self.max),
            Scope::Ip => self.max,
        }
    }

    /// Denial text for a key of the given scope.
    pub fn message_for(&self, scope: Scope) -> &str {
        match scope {
            Scope::User => self
                .authenticated_message
                .as_deref()
                .unwrap_or(DEFAULT_AUTHENTICATED_MESSAGE),
            Scope::Ip => self.message.as_deref().unwrap_or(DEFAULT_MESSAGE),
        }
    }

    /// The authenticated ceiling, when signing in would actually raise the
    /// caller's limit.
    pub fn upgrade_limit(&self) -> Option<u64> {
        if !self.is_authentication_aware() {
            return None;
        }
        self.authenticated_max.filter(|&limit| limit > self.max)
    }
}

/// A policy bound to the route it protects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Route path, e.g. `/ai-search`
    pub route: String,
    /// Limits for this route
    pub policy: PolicyConfig,
}

impl RoutePolicy {
    /// Bind `policy` to `route`.
    pub fn new(route: impl Into<String>, policy: PolicyConfig) -> Self {
        Self {
            route: route.into(),
            policy,
        }
    }

    /// Validate the route path and its policy.
    ///
    /// Paths use the router's syntax: `:name` captures one segment and
    /// `*name` captures the rest of the path, so it must come last.
    pub fn validate(&self) -> Result<()> {
        check_route_syntax(&self.route).map_err(|reason| {
            LimiterError::Config(format!("route '{}' {}", self.route, reason))
        })?;
        self.policy.validate().map_err(|e| match e {
            LimiterError::Config(msg) => {
                LimiterError::Config(format!("route '{}': {}", self.route, msg))
            }
            other => other,
        })
    }
}

fn check_route_syntax(route: &str) -> std::result::Result<(), &'static str> {
    let Some(rest) = route.strip_prefix('/') else {
        return Err("must start with '/'");
    };

    let mut segments = rest.split('/').peekable();
    while let Some(segment) = segments.next() {
        let name = match segment.chars().next() {
            Some(':') => &segment[1..],
            Some('*') => {
                if segments.peek().is_some() {
                    return Err("has a wildcard that is not the last segment");
                }
                &segment[1..]
            }
            _ => segment,
        };
        if name.contains([':', '*']) {
            return Err("may only capture a parameter at the start of a segment");
        }
        if name.is_empty() && segment.len() == 1 {
            return Err("has a parameter without a name");
        }
    }
    Ok(())
}

/// Validate each route policy and reject routes bound more than once.
pub fn validate_route_policies(policies: &[RoutePolicy]) -> Result<()> {
    let mut seen = HashSet::new();
    for route_policy in policies {
        route_policy.validate()?;
        if !seen.insert(route_policy.route.as_str()) {
            return Err(LimiterError::Config(format!(
                "route '{}' has more than one policy",
                route_policy.route
            )));
        }
    }
    Ok(())
}
