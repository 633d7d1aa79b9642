//! Policy evaluation: the allow/deny decision for a single request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{trace, warn};

use super::entry::format_reset_time;
use super::key::{RateLimitKey, RequestDescriptor, Scope};
use super::policy::PolicyConfig;
use super::store::{MemoryStore, RateLimitStore};

/// Rate limit state reported to callers on every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Ceiling that applied to this request
    pub limit: u64,
    /// Requests left in the window, never negative
    pub remaining: u64,
    /// When the window resets
    pub reset_time: DateTime<Utc>,
    /// Whether the caller was keyed by address or user
    pub scope: Scope,
}

/// Hint telling anonymous callers that signing in raises their ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeHint {
    pub suggestion: String,
    pub authenticated_limit: u64,
    pub current_limit: u64,
}

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Denial {
    pub status: &'static str,
    pub message: String,
    /// Seconds until the window resets, rounded up
    pub retry_after: u64,
    pub limit: u64,
    pub remaining: u64,
    #[serde(serialize_with = "serialize_reset_time")]
    pub reset_time: DateTime<Utc>,
    pub rate_limit_type: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeHint>,
}

fn serialize_reset_time<S: Serializer>(
    time: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_reset_time(*time))
}

/// The evaluator's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let the request through and report the status in headers.
    Allowed(RateLimitStatus),
    /// Short-circuit with a 429.
    Denied(Denial),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }
}

/// Applies route policies to requests against a shared store.
///
/// One evaluator (and one store) is built per process and shared by every
/// protected route.
pub struct PolicyEvaluator<S: RateLimitStore + ?Sized = MemoryStore> {
    store: Arc<S>,
}

impl PolicyEvaluator<MemoryStore> {
    /// Create an evaluator over a fresh in-memory store.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }
}

impl Default for PolicyEvaluator<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RateLimitStore + ?Sized> PolicyEvaluator<S> {
    /// Create an evaluator over an existing store.
    pub fn with_store(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The store backing this evaluator.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Decide whether `request` may proceed under `policy` at time `now`.
    ///
    /// Allowed requests are counted; denied requests are not.
    pub fn evaluate(
        &self,
        request: &RequestDescriptor,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> Decision {
        let key = RateLimitKey::resolve(request, policy.is_authentication_aware());
        let ceiling = policy.ceiling_for(key.scope);

        let consumption = self
            .store
            .try_consume(&key.to_string(), policy.window(), ceiling, now);
        let entry = consumption.entry;

        if !consumption.allowed {
            let retry_after = entry.retry_after_secs(now);
            warn!(
                key = %key,
                method = %request.method,
                limit = ceiling,
                retry_after = retry_after,
                "Rate limit exceeded"
            );

            let upgrade = if key.scope == Scope::Ip && request.identity().is_none() {
                policy.upgrade_limit().map(|authenticated_limit| UpgradeHint {
                    suggestion: format!(
                        "Sign in to raise your limit to {} requests per window.",
                        authenticated_limit
                    ),
                    authenticated_limit,
                    current_limit: ceiling,
                })
            } else {
                None
            };

            return Decision::Denied(Denial {
                status: "error",
                message: policy.message_for(key.scope).to_string(),
                retry_after,
                limit: ceiling,
                remaining: 0,
                reset_time: entry.reset_time,
                rate_limit_type: key.scope,
                upgrade,
            });
        }

        let remaining = entry.remaining(ceiling);
        trace!(
            key = %key,
            count = entry.count,
            remaining = remaining,
            "Request within rate limit"
        );

        Decision::Allowed(RateLimitStatus {
            limit: ceiling,
            remaining,
            reset_time: entry.reset_time,
            scope: key.scope,
        })
    }
}
