//! Rate limit key derivation.

use serde::Serialize;
use tracing::warn;

/// Identity used when nothing about the caller can be resolved.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Classification of a rate limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Keyed by client address
    Ip,
    /// Keyed by authenticated user id
    User,
}

impl Scope {
    /// Tag used in keys and the `X-RateLimit-Type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the limiter needs to know about an incoming request.
///
/// The HTTP adapter fills this in from the host framework; the evaluator
/// never sees framework types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    /// HTTP method
    pub method: String,
    /// Route path the policy is attached to
    pub path: String,
    /// Client address as resolved by the framework (proxy aware)
    pub resolved_ip: Option<String>,
    /// Address of the connected socket
    pub socket_addr: Option<String>,
    /// Raw `X-Forwarded-For` header value
    pub forwarded_for: Option<String>,
    /// Verified user id placed on the request by upstream authentication
    pub authenticated_identity: Option<String>,
}

impl RequestDescriptor {
    /// Create a descriptor for `method` and `path` with no identity attached.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Attach the proxy-aware client address.
    pub fn with_resolved_ip(mut self, ip: impl Into<String>) -> Self {
        self.resolved_ip = Some(ip.into());
        self
    }

    /// Attach the connected socket's address.
    pub fn with_socket_addr(mut self, addr: impl Into<String>) -> Self {
        self.socket_addr = Some(addr.into());
        self
    }

    /// Attach the raw `X-Forwarded-For` value.
    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    /// Attach the authenticated user id.
    pub fn with_identity(mut self, user_id: impl Into<String>) -> Self {
        self.authenticated_identity = Some(user_id.into());
        self
    }

    /// The authenticated user id, if upstream auth supplied a usable one.
    pub fn identity(&self) -> Option<&str> {
        non_empty(self.authenticated_identity.as_deref())
    }

    /// Best available client address: framework-resolved IP, then socket
    /// address, then the first `X-Forwarded-For` hop.
    pub fn client_address(&self) -> Option<&str> {
        non_empty(self.resolved_ip.as_deref())
            .or_else(|| non_empty(self.socket_addr.as_deref()))
            .or_else(|| {
                self.forwarded_for
                    .as_deref()
                    .and_then(|header| non_empty(header.split(',').next().map(str::trim)))
            })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// A key that uniquely identifies one caller on one route.
///
/// Rendered as `<scope>:<identity>:<route>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Whether the caller is keyed by address or by user
    pub scope: Scope,
    /// Client address, user id, or `unknown`
    pub identity: String,
    /// Route the policy protects
    pub route: String,
}

impl RateLimitKey {
    /// Derive the key for a request.
    ///
    /// Authenticated callers are keyed by user only when the policy is
    /// authentication aware. Callers with no resolvable address share the
    /// `unknown` identity rather than being exempted.
    pub fn resolve(request: &RequestDescriptor, authentication_aware: bool) -> Self {
        if authentication_aware {
            if let Some(user_id) = request.identity() {
                return Self {
                    scope: Scope::User,
                    identity: user_id.to_string(),
                    route: request.path.clone(),
                };
            }
        }

        let identity = match request.client_address() {
            Some(addr) => addr.to_string(),
            None => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    "Could not resolve client address, using 'unknown'"
                );
                UNKNOWN_IDENTITY.to_string()
            }
        };

        Self {
            scope: Scope::Ip,
            identity,
            route: request.path.clone(),
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.scope, self.identity, self.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_key_prefers_resolved_address() {
        let request = RequestDescriptor::new("GET", "/ai-search")
            .with_resolved_ip("203.0.113.7")
            .with_socket_addr("10.0.0.1")
            .with_forwarded_for("198.51.100.2");

        let key = RateLimitKey::resolve(&request, false);
        assert_eq!(key.scope, Scope::Ip);
        assert_eq!(key.to_string(), "ip:203.0.113.7:/ai-search");
    }

    #[test]
    fn test_ip_key_falls_back_to_socket_then_forwarded() {
        let request = RequestDescriptor::new("GET", "/ai-search")
            .with_socket_addr("10.0.0.1")
            .with_forwarded_for("198.51.100.2");
        assert_eq!(
            RateLimitKey::resolve(&request, false).to_string(),
            "ip:10.0.0.1:/ai-search"
        );

        let request = RequestDescriptor::new("GET", "/ai-search")
            .with_forwarded_for(" 198.51.100.2 , 10.0.0.1");
        assert_eq!(
            RateLimitKey::resolve(&request, false).to_string(),
            "ip:198.51.100.2:/ai-search"
        );
    }

    #[test]
    fn test_unresolvable_caller_is_unknown() {
        let request = RequestDescriptor::new("POST", "/ideas").with_forwarded_for("");

        let key = RateLimitKey::resolve(&request, true);
        assert_eq!(key.scope, Scope::Ip);
        assert_eq!(key.identity, UNKNOWN_IDENTITY);
        assert_eq!(key.to_string(), "ip:unknown:/ideas");
    }

    #[test]
    fn test_user_key_requires_authentication_aware_policy() {
        let request = RequestDescriptor::new("GET", "/ai-search")
            .with_resolved_ip("203.0.113.7")
            .with_identity("42");

        assert_eq!(
            RateLimitKey::resolve(&request, true).to_string(),
            "user:42:/ai-search"
        );
        assert_eq!(
            RateLimitKey::resolve(&request, false).to_string(),
            "ip:203.0.113.7:/ai-search"
        );
    }

    #[test]
    fn test_empty_identity_is_anonymous() {
        let request = RequestDescriptor::new("GET", "/ai-search")
            .with_resolved_ip("203.0.113.7")
            .with_identity("");

        assert_eq!(RateLimitKey::resolve(&request, true).scope, Scope::Ip);
    }

    #[test]
    fn test_scope_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Scope::Ip).unwrap(), "\"ip\"");
        assert_eq!(serde_json::to_string(&Scope::User).unwrap(), "\"user\"");
    }
}
