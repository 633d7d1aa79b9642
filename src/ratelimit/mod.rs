//! Rate limiting logic and state management.

mod entry;
mod key;
mod limiter;
mod policy;
mod store;

pub use entry::{format_reset_time, RateLimitEntry};
pub use key::{RateLimitKey, RequestDescriptor, Scope, UNKNOWN_IDENTITY};
pub use limiter::{Decision, Denial, PolicyEvaluator, RateLimitStatus, UpgradeHint};
pub use policy::{
    validate_route_policies, PolicyConfig, RoutePolicy, DEFAULT_AUTHENTICATED_MESSAGE,
    DEFAULT_MESSAGE,
};
pub use store::{spawn_sweeper, Consumption, MemoryStore, RateLimitStore};
