//! Sliding-window rate limiting.

mod key;
mod limiter;
mod rules;

pub use key::{OperationClass, RateLimitKey};
pub use limiter::{RateLimitResult, SlidingWindowLimiter, DEFAULT_KEY_PREFIX};
pub use rules::{RateLimitPresets, RateLimitRule};
