//! # Rate Limiter
//!
//! Three interchangeable throttling algorithms routed by ordered rules.
//! Counters live in the shared store under client+path+granularity keys
//! and expire with their windows, so limits hold across every process
//! instance without any coordination beyond the store itself.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RateLimiter`] | Check-and-charge admission against the store |
//! | [`RuleSet`] / [`RateLimitRule`] | Ordered first-match rule routing |
//! | [`RateLimitConfig`] | Per-rule limits, algorithm and burst capacity |
//! | [`RateLimitResult`] | Allow/deny with usage, reset and retry-after |
//! | [`algorithms`] | Sliding window, token bucket, fixed window |

pub mod algorithms;
mod limiter;
mod rules;

pub use limiter::{ClientUsage, RateLimitResult, RateLimiter, RateLimiterStats};
pub use rules::{
    ClientType, Granularity, LimitType, RateLimitAlgorithm, RateLimitConfig, RateLimitRule,
    RuleSet,
};
