//! Resilience patterns for the Meta Ads client.
//!
//! Provides per-account rate limiting, retry with backoff, an idempotency
//! cache for writes, and the orchestrator composing them.

pub mod idempotency;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;

pub use idempotency::{IdempotencyCache, IdempotencyConfig, IdempotencyEntry, IdempotentOutcome};
pub use orchestrator::{
    create_orchestrator, CallOptions, Executed, ResilienceConfig, ResilienceOrchestrator,
};
pub use rate_limiter::{decayed_score, RateLimitTier, RateLimiter, RateLimiterConfig, UsageRecord};
pub use retry::{DefaultRetryPolicy, RetryConfig, RetryPolicy};
