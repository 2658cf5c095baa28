//! Retry policy with exponential backoff for classified failures.

use crate::errors::{ClassifiedError, ErrorKind};
use rand::Rng;
use std::time::Duration;

/// Configuration for backoff delays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry, doubled per attempt
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay
    pub max_delay: Duration,
    /// Width of the uniform jitter window added on top
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter window; zero disables jitter
    pub fn max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Exponential part of the delay after the failed attempt `attempt`
    /// (zero-based), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        let delay = base.saturating_mul(2u64.saturating_pow(attempt)).min(cap);
        Duration::from_millis(delay)
    }

    /// Backoff plus uniform jitter in `[0, max_jitter)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = self.max_jitter.as_millis() as u64;
        let jitter = if jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter)
        };
        self.backoff_delay(attempt) + Duration::from_millis(jitter)
    }
}

/// Decides whether and when a classified failure is retried
pub trait RetryPolicy: Send + Sync {
    /// Whether the error may be retried at all
    fn should_retry(&self, error: &ClassifiedError) -> bool;

    /// Retry ceiling for this error class
    fn max_retries(&self, error: &ClassifiedError) -> u32;

    /// Wait before the next attempt; `attempt` is the zero-based index of the
    /// attempt that just failed
    fn next_delay(&self, error: &ClassifiedError, attempt: u32) -> Duration;
}

/// Default retry policy
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy {
    config: RetryConfig,
}

impl DefaultRetryPolicy {
    /// Create a policy with default backoff
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy with custom backoff
    pub fn with_config(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, error: &ClassifiedError) -> bool {
        match error.kind {
            ErrorKind::RateLimited
            | ErrorKind::ApplicationLimit
            | ErrorKind::UserLimit
            | ErrorKind::NetworkTransient => true,
            ErrorKind::ServerError => error.retryable,
            ErrorKind::AuthExpired
            | ErrorKind::PermissionDenied
            | ErrorKind::Validation
            | ErrorKind::Unknown => false,
        }
    }

    fn max_retries(&self, error: &ClassifiedError) -> u32 {
        match error.kind {
            ErrorKind::RateLimited => 3,
            ErrorKind::ApplicationLimit | ErrorKind::UserLimit => 2,
            ErrorKind::NetworkTransient => 3,
            ErrorKind::ServerError if error.retryable => 3,
            _ => 0,
        }
    }

    fn next_delay(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        match error.retry_after() {
            Some(wait) => wait,
            None => self.config.delay_for_attempt(attempt),
        }
    }
}
