mod coordinator;
mod rate_limiter;

pub use coordinator::{build_attempts, expand_route, Attempt, AttemptExecutor, FailoverCoordinator, KeyRegistry};
pub use rate_limiter::{RateLimitInfo, RateLimiter};
