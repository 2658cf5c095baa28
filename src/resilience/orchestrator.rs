//! Resilience orchestrator combining rate limiting, retry and idempotency.

use super::{
    DefaultRetryPolicy, IdempotencyCache, IdempotencyConfig, RateLimiter, RateLimiterConfig,
    RetryConfig, RetryPolicy,
};
use crate::errors::{AdsError, AdsResult, ClassifiedError, ErrorClassifier, Failure};
use crate::observability::MetricsCollector;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Configuration for resilience orchestrator
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Default rate limits
    pub rate_limiter: RateLimiterConfig,
    /// Backoff configuration
    pub retry: RetryConfig,
    /// Idempotency cache configuration
    pub idempotency: IdempotencyConfig,
    /// Whether to enable rate limiting
    pub rate_limiting_enabled: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            rate_limiting_enabled: true,
        }
    }
}

impl ResilienceConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set rate limiter configuration
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    /// Set retry configuration
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Set idempotency configuration
    pub fn idempotency(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency = config;
        self
    }

    /// Enable or disable rate limiting
    pub fn enable_rate_limiting(mut self, enabled: bool) -> Self {
        self.rate_limiting_enabled = enabled;
        self
    }
}

/// Per-call options
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Account the call is charged to
    pub account_key: String,
    /// Whether the call mutates upstream state
    pub is_write: bool,
    /// Operation name for logs and metrics
    pub operation_name: String,
    /// Idempotency key for writes
    pub idempotency_key: Option<String>,
    /// Cooperative cancellation, polled between attempts
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    /// Options for a read
    pub fn read(account_key: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self {
            account_key: account_key.into(),
            is_write: false,
            operation_name: operation_name.into(),
            idempotency_key: None,
            cancellation: None,
        }
    }

    /// Options for a write
    pub fn write(account_key: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self {
            is_write: true,
            ..Self::read(account_key, operation_name)
        }
    }

    /// Set the idempotency key
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attach a cancellation token
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Successful call
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    /// Operation result
    pub result: Value,
    /// Request id; replayed results keep the id of the original execution
    pub request_id: String,
    /// Whether the result came from the idempotency cache
    pub cached: bool,
    /// Attempts made by this call (0 when replayed)
    pub attempts: u32,
}

/// Orchestrator for combining resilience patterns
pub struct ResilienceOrchestrator {
    config: ResilienceConfig,
    rate_limiter: Arc<RateLimiter>,
    idempotency: Arc<IdempotencyCache>,
    retry_policy: Arc<dyn RetryPolicy>,
    classifier: ErrorClassifier,
    metrics: Arc<MetricsCollector>,
}

impl ResilienceOrchestrator {
    /// Create a new orchestrator with default configuration
    pub fn new() -> Self {
        Self::with_config(ResilienceConfig::default())
    }

    /// Create a new orchestrator with custom configuration
    pub fn with_config(config: ResilienceConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        Self {
            rate_limiter: Arc::new(RateLimiter::with_config(config.rate_limiter.clone())),
            idempotency: Arc::new(IdempotencyCache::with_metrics(
                config.idempotency.clone(),
                metrics.clone(),
            )),
            retry_policy: Arc::new(DefaultRetryPolicy::with_config(config.retry.clone())),
            classifier: ErrorClassifier::new(),
            metrics,
            config,
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Orchestrator configuration
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Shared rate limiter
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Shared idempotency cache
    pub fn idempotency(&self) -> &Arc<IdempotencyCache> {
        &self.idempotency
    }

    /// Shared metrics
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Execute an operation with all resilience patterns applied.
    ///
    /// Writes consult the idempotency cache first; a replayed result costs
    /// no rate budget. Every attempt reserves rate budget before it is sent,
    /// and a local rejection is returned without retrying.
    #[instrument(
        skip(self, options, operation),
        fields(
            account = %options.account_key,
            operation = %options.operation_name,
            is_write = options.is_write
        )
    )]
    pub async fn execute_with_resilience<F, Fut>(
        &self,
        options: CallOptions,
        operation: F,
    ) -> AdsResult<Executed>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, Failure>>,
    {
        if options.is_cancelled() {
            return Err(AdsError::Cancelled {
                attempts: 0,
                last_error: None,
            });
        }

        let started = Instant::now();
        let attempts = AtomicU32::new(0);

        if !options.is_write {
            let result = self
                .run_with_retry(&options, &operation, started, &attempts)
                .await?;
            return Ok(Executed {
                result,
                request_id: Uuid::new_v4().to_string(),
                cached: false,
                attempts: attempts.load(Ordering::SeqCst),
            });
        }

        let (this, opts, op, counter) = (self, &options, &operation, &attempts);
        let execute =
            move || async move { this.run_with_retry(opts, op, started, counter).await };
        let key = options.idempotency_key.as_deref();
        let outcome = match &options.cancellation {
            Some(token) => {
                self.idempotency
                    .with_idempotency_cancellable(
                        key,
                        &options.operation_name,
                        token,
                        || cancelled(&attempts, None),
                        execute,
                    )
                    .await?
            }
            None => {
                self.idempotency
                    .with_idempotency(key, &options.operation_name, execute)
                    .await?
            }
        };

        Ok(Executed {
            result: outcome.result,
            request_id: outcome.request_id,
            cached: outcome.cached,
            attempts: attempts.load(Ordering::SeqCst),
        })
    }

    fn check_rate_limit(
        &self,
        options: &CallOptions,
        attempts: u32,
        started: Instant,
    ) -> AdsResult<()> {
        if !self.config.rate_limiting_enabled {
            return Ok(());
        }
        self.rate_limiter
            .check_rate_limit(&options.account_key, options.is_write)
            .map_err(|error| {
                self.metrics.record_rate_limit_rejection();
                AdsError::Api(error.annotate(attempts, started.elapsed()))
            })
    }

    async fn run_with_retry<F, Fut>(
        &self,
        options: &CallOptions,
        operation: &F,
        started: Instant,
        attempts: &AtomicU32,
    ) -> AdsResult<Value>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, Failure>>,
    {
        let name = options.operation_name.as_str();
        let mut last_error: Option<ClassifiedError> = None;
        let mut retries: u32 = 0;

        loop {
            if options.is_cancelled() {
                warn!(operation = name, "Operation cancelled before next attempt");
                return Err(cancelled(attempts, last_error));
            }

            self.check_rate_limit(options, attempts.load(Ordering::SeqCst), started)?;

            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let attempt_started = Instant::now();
            let outcome = operation().await;
            let latency = attempt_started.elapsed();

            let failure = match outcome {
                Ok(value) => {
                    self.metrics.record_attempt(name, latency, true);
                    if attempt > 0 {
                        debug!(operation = name, attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            self.metrics.record_attempt(name, latency, false);
            let error = self.classifier.classify(&failure);

            if !self.retry_policy.should_retry(&error)
                || retries >= self.retry_policy.max_retries(&error)
            {
                let error = error.annotate(attempt + 1, started.elapsed());
                warn!(
                    operation = name,
                    attempts = attempt + 1,
                    code = error.kind.code(),
                    retryable = error.retryable,
                    error = %error.message,
                    "Operation failed permanently"
                );
                return Err(AdsError::Api(error));
            }

            let delay = self.retry_policy.next_delay(&error, attempt);
            retries += 1;
            self.metrics.record_retry();
            debug!(
                operation = name,
                attempt = attempt + 1,
                code = error.kind.code(),
                delay_ms = delay.as_millis() as u64,
                "Retrying operation"
            );
            last_error = Some(error);

            match &options.cancellation {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            warn!(operation = name, "Operation cancelled during retry wait");
                            return Err(cancelled(attempts, last_error));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

fn cancelled(attempts: &AtomicU32, last_error: Option<ClassifiedError>) -> AdsError {
    AdsError::Cancelled {
        attempts: attempts.load(Ordering::SeqCst),
        last_error: last_error.map(Box::new),
    }
}

impl Default for ResilienceOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResilienceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("config", &self.config)
            .field("rate_limiter", &self.rate_limiter)
            .field("idempotency", &self.idempotency)
            .finish()
    }
}

/// Create a shared orchestrator with custom configuration
pub fn create_orchestrator(config: ResilienceConfig) -> Arc<ResilienceOrchestrator> {
    Arc::new(ResilienceOrchestrator::with_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, ErrorOrigin, TransportError};
    use serde_json::json;
    use std::time::Duration;

    fn orchestrator() -> ResilienceOrchestrator {
        ResilienceOrchestrator::with_config(
            ResilienceConfig::new().retry(RetryConfig::new().max_jitter(Duration::ZERO)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_success() {
        let executed = orchestrator()
            .execute_with_resilience(CallOptions::read("act_1", "insights.get"), || async {
                Ok(json!({"data": []}))
            })
            .await
            .unwrap();

        assert_eq!(executed.attempts, 1);
        assert!(!executed.cached);
        assert_eq!(executed.result, json!({"data": []}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let orchestrator = orchestrator();
        let attempts = AtomicU32::new(0);

        let error = orchestrator
            .execute_with_resilience(CallOptions::read("act_1", "campaigns.get"), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Failure::Classified(ClassifiedError::new(
                    ErrorKind::Validation,
                    "Invalid parameter",
                )))
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(error.error_code(), "META_VALIDATION");
        assert_eq!(orchestrator.metrics().retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_annotated() {
        let orchestrator = orchestrator();

        let error = orchestrator
            .execute_with_resilience(CallOptions::read("act_1", "campaigns.get"), || async {
                Err(Failure::Transport(TransportError::Timeout))
            })
            .await
            .unwrap_err();

        let classified = error.classified().unwrap();
        assert_eq!(classified.kind, ErrorKind::NetworkTransient);
        assert_eq!(classified.attempts, 4);
        // 1s + 2s + 4s of backoff
        let elapsed = classified.elapsed_ms.unwrap();
        assert!((7_000..7_010).contains(&elapsed), "elapsed {}ms", elapsed);
        assert_eq!(orchestrator.metrics().retries(), 3);
        assert_eq!(orchestrator.metrics().attempt_count("campaigns.get"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_rejection_is_not_retried() {
        let orchestrator = ResilienceOrchestrator::with_config(
            ResilienceConfig::new().rate_limiter(RateLimiterConfig::new().max_score(1.0)),
        );
        let options = CallOptions::read("act_1", "ads.get");

        orchestrator
            .execute_with_resilience(options.clone(), || async { Ok(json!(1)) })
            .await
            .unwrap();

        let attempts = AtomicU32::new(0);
        let error = orchestrator
            .execute_with_resilience(options, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(json!(2))
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(error.error_code(), "META_RATE_LIMITED");
        assert_eq!(orchestrator.metrics().rate_limit_rejections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_pays_rate_budget() {
        let orchestrator = ResilienceOrchestrator::with_config(
            ResilienceConfig::new()
                .rate_limiter(RateLimiterConfig::new().max_score(2.0))
                .retry(RetryConfig::new().max_jitter(Duration::ZERO)),
        );
        let attempts = AtomicU32::new(0);

        let error = orchestrator
            .execute_with_resilience(CallOptions::read("act_1", "insights.get"), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Failure::Transport(TransportError::Timeout))
            })
            .await
            .unwrap_err();

        // Third attempt is rejected locally before it is sent
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let classified = error.classified().unwrap();
        assert_eq!(classified.kind, ErrorKind::RateLimited);
        assert_eq!(classified.origin, ErrorOrigin::LocalRateLimiter);
        assert_eq!(classified.attempts, 2);
        assert_eq!(orchestrator.metrics().retries(), 2);
        assert_eq!(orchestrator.metrics().rate_limit_rejections(), 1);
        assert!(orchestrator.rate_limiter().is_account_blocked("act_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_write_skips_rate_limit() {
        let orchestrator = orchestrator();
        let options = CallOptions::write("act_1", "campaigns.create").idempotency_key("k1");

        let first = orchestrator
            .execute_with_resilience(options.clone(), || async { Ok(json!({"id": "c1"})) })
            .await
            .unwrap();
        let second = orchestrator
            .execute_with_resilience(options, || async { Ok(json!({"id": "c2"})) })
            .await
            .unwrap();

        assert!(second.cached);
        assert_eq!(second.attempts, 0);
        assert_eq!(second.request_id, first.request_id);
        assert_eq!(orchestrator.rate_limiter().current_score("act_1"), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();

        let error = orchestrator()
            .execute_with_resilience(
                CallOptions::read("act_1", "ads.get").cancellation(token),
                || async { Ok(json!(1)) },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AdsError::Cancelled {
                attempts: 0,
                last_error: None
            }
        ));
    }
}
