//! Request throttling for the Paperflow engine.
//!
//! Every external provider owns an independent token bucket; callers take a
//! permit before each provider call, either waiting for a refill (bounded by a
//! timeout) or failing fast.
//!
//! # Main types
//!
//! - [`RateLimiter`] — Per-provider token-bucket governor.
//! - [`BucketConfig`] — Capacity and refill rate of one bucket.
//! - [`AcquireMode`] — Wait for a token or fail fast.
//! - [`RatePermit`] — Proof that a token was consumed.

/// Token-bucket rate limiting.
pub mod rate_limit;

pub use rate_limit::{AcquireMode, BucketConfig, RateLimiter, RatePermit};
