//! Adaptive rate limiting for shared resources.
//!
//! Each resource gets a [`TokenBucket`] and a [`ServiceHealthRecord`]. Call
//! outcomes reported through [`AdaptiveRateLimiter::record_outcome`] move
//! the health record between [`HealthState`]s, and the bucket's effective
//! capacity and refill rate follow the health state's throughput factor.

mod bucket;
mod health;
mod limiter;

pub use bucket::{BucketSettings, RefillRate, TokenBucket};
pub use health::{
    FULL_THROUGHPUT, HealthState, HealthThresholds, HealthTransition, ServiceHealthRecord,
};
pub use limiter::{AdaptiveRateLimiter, BucketSnapshot, ExecuteError, RateLimitError};
