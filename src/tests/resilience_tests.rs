//! Resilience tests.
//!
//! Timing-sensitive tests run on a paused clock; sleeps complete instantly
//! while `Instant::now()` still advances by the slept amount.

use crate::errors::{
    AdsError, ClassifiedError, ErrorClassifier, ErrorKind, ErrorOrigin, Failure,
};
use crate::resilience::{
    CallOptions, IdempotencyCache, IdempotencyConfig, RateLimitTier, RateLimiter,
    ResilienceConfig, ResilienceOrchestrator, RetryConfig,
};
use crate::transport::ApiResponse;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn upstream(status: u16, body: Value) -> Failure {
    Failure::Response(ApiResponse::new(status, Bytes::from(body.to_string())))
}

fn server_error() -> Failure {
    upstream(500, json!({"error": {"code": 2, "message": "Service temporarily unavailable"}}))
}

/// Records the start time of every attempt
#[derive(Default)]
struct AttemptLog {
    starts: Mutex<Vec<Instant>>,
}

impl AttemptLog {
    fn record(&self) -> usize {
        let mut starts = self.starts.lock();
        starts.push(Instant::now());
        starts.len()
    }

    fn gaps(&self) -> Vec<Duration> {
        self.starts
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

// Rate limiter

#[tokio::test(start_paused = true)]
async fn test_accounts_are_isolated() {
    let limiter = RateLimiter::for_tier(RateLimitTier::Development);

    for _ in 0..20 {
        limiter.check_rate_limit("act_a", true).unwrap();
    }
    assert!(limiter.check_rate_limit("act_a", true).is_err());
    assert!(limiter.is_account_blocked("act_a"));

    assert_eq!(limiter.current_score("act_b"), 0.0);
    assert_eq!(limiter.remaining_capacity("act_b"), 60.0);
    assert!(limiter.check_rate_limit("act_b", true).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_sixty_reads_then_rejection() {
    let limiter = RateLimiter::for_tier(RateLimitTier::Development);

    for call in 1..=60 {
        assert!(
            limiter.check_rate_limit("act_1", false).is_ok(),
            "read {} should pass",
            call
        );
    }
    assert_eq!(limiter.current_score("act_1"), 60.0);
    assert_eq!(limiter.remaining_capacity("act_1"), 0.0);

    let error = limiter.check_rate_limit("act_1", false).unwrap_err();
    assert_eq!(error.kind, ErrorKind::RateLimited);
    assert_eq!(error.origin, ErrorOrigin::LocalRateLimiter);
    assert_eq!(error.retry_after_ms, Some(300_000));
}

#[tokio::test(start_paused = true)]
async fn test_twenty_writes_reach_limit_exactly() {
    let limiter = RateLimiter::for_tier(RateLimitTier::Development);

    for _ in 0..19 {
        limiter.check_rate_limit("act_1", true).unwrap();
    }
    assert_eq!(limiter.current_score("act_1"), 57.0);

    limiter.check_rate_limit("act_1", true).unwrap();
    assert_eq!(limiter.current_score("act_1"), 60.0);
    assert!(!limiter.is_account_blocked("act_1"));

    assert!(limiter.check_rate_limit("act_1", true).is_err());
    assert!(limiter.is_account_blocked("act_1"));
}

#[tokio::test(start_paused = true)]
async fn test_reset_account_clears_state() {
    let limiter = RateLimiter::for_tier(RateLimitTier::Development);
    for _ in 0..25 {
        let _ = limiter.check_rate_limit("act_1", true);
    }
    let _ = limiter.check_rate_limit("act_2", true);
    assert!(limiter.is_account_blocked("act_1"));

    limiter.reset_account("act_1");

    assert_eq!(limiter.current_score("act_1"), 0.0);
    assert!(!limiter.is_account_blocked("act_1"));
    assert_eq!(limiter.current_score("act_2"), 3.0);
}

#[tokio::test(start_paused = true)]
async fn test_standard_tier_blocks_for_one_minute() {
    let limiter = RateLimiter::for_tier(RateLimitTier::Standard);
    for _ in 0..3000 {
        limiter.check_rate_limit("act_1", true).unwrap();
    }

    let error = limiter.check_rate_limit("act_1", true).unwrap_err();
    assert_eq!(error.retry_after_ms, Some(60_000));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_call_still_accrues_cost() {
    let limiter = RateLimiter::for_tier(RateLimitTier::Development);
    for _ in 0..60 {
        limiter.check_rate_limit("act_1", false).unwrap();
    }

    limiter.check_rate_limit("act_1", true).unwrap_err();
    assert_eq!(limiter.current_score("act_1"), 63.0);

    // Calls inside the block window add nothing
    limiter.check_rate_limit("act_1", true).unwrap_err();
    assert_eq!(limiter.current_score("act_1"), 63.0);
}

#[tokio::test(start_paused = true)]
async fn test_block_expires_and_score_decays() {
    let limiter = RateLimiter::for_tier(RateLimitTier::Development);
    for _ in 0..21 {
        let _ = limiter.check_rate_limit("act_1", true);
    }
    assert!(limiter.is_account_blocked("act_1"));

    tokio::time::advance(Duration::from_secs(300)).await;

    assert!(!limiter.is_account_blocked("act_1"));
    assert_eq!(limiter.current_score("act_1"), 0.0);
    assert!(limiter.check_rate_limit("act_1", true).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_checks_never_overshoot() {
    let limiter = Arc::new(RateLimiter::for_tier(RateLimitTier::Development));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check_rate_limit("act_1", false).is_ok() })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 60);
}

// Idempotency

#[tokio::test(start_paused = true)]
async fn test_same_key_executes_once() {
    let cache = IdempotencyCache::new();
    let calls = AtomicU32::new(0);

    let execute = || async {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(json!({"id": format!("camp_{}", n)}))
    };

    let first = cache
        .with_idempotency(Some("k"), "campaigns.create", execute)
        .await
        .unwrap();
    let second = cache
        .with_idempotency(Some("k"), "campaigns.create", execute)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.result, second.result);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_is_executed_again() {
    let cache = IdempotencyCache::with_config(IdempotencyConfig::new().ttl(Duration::from_secs(60)));
    let calls = AtomicU32::new(0);
    let execute = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(json!({"ok": true}))
    };

    cache.with_idempotency(Some("k"), "ads.update", execute).await.unwrap();
    tokio::time::advance(Duration::from_secs(59)).await;
    let hit = cache.with_idempotency(Some("k"), "ads.update", execute).await.unwrap();
    assert!(hit.cached);

    tokio::time::advance(Duration::from_secs(2)).await;
    let miss = cache.with_idempotency(Some("k"), "ads.update", execute).await.unwrap();

    assert!(!miss.cached);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_default_ttl_is_twenty_four_hours() {
    let cache = IdempotencyCache::new();
    let execute = || async { Ok::<_, String>(json!(1)) };

    cache.with_idempotency(Some("k"), "op", execute).await.unwrap();
    tokio::time::advance(Duration::from_secs(24 * 3600 - 1)).await;
    assert!(cache.get("k").is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(cache.get("k").is_none());
}

// Classification

#[test]
fn test_classification_examples() {
    let classifier = ErrorClassifier::new();

    let auth = classifier.classify(&upstream(400, json!({"error": {"code": 190}})));
    assert_eq!(auth.kind, ErrorKind::AuthExpired);

    let limited = classifier.classify(&upstream(
        400,
        json!({"error": {"code": 17, "error_subcode": 2446079}}),
    ));
    assert_eq!(limited.kind, ErrorKind::RateLimited);
    assert_eq!(limited.retry_after_ms, Some(300_000));

    let validation = classifier.classify(&upstream(400, json!({"error": {"code": 100}})));
    assert_eq!(validation.kind, ErrorKind::Validation);
    assert!(!validation.retryable);
}

// Orchestrator

fn orchestrator() -> ResilienceOrchestrator {
    ResilienceOrchestrator::with_config(ResilienceConfig::new())
}

#[tokio::test(start_paused = true)]
async fn test_server_error_twice_then_success() {
    let orchestrator = orchestrator();
    let log = AttemptLog::default();

    let executed = orchestrator
        .execute_with_resilience(CallOptions::read("act_1", "campaigns.list"), || async {
            if log.record() <= 2 {
                Err(server_error())
            } else {
                Ok(json!({"data": [{"id": "1"}]}))
            }
        })
        .await
        .unwrap();

    assert_eq!(executed.attempts, 3);
    assert_eq!(executed.result, json!({"data": [{"id": "1"}]}));

    let gaps = log.gaps();
    let retry = RetryConfig::default();
    assert_eq!(gaps.len(), 2);
    for (attempt, gap) in gaps.iter().enumerate() {
        let minimum = retry.backoff_delay(attempt as u32);
        assert!(*gap >= minimum, "gap {:?} below backoff {:?}", gap, minimum);
        assert!(*gap < minimum + retry.max_jitter + Duration::from_millis(5));
    }
    assert_eq!(orchestrator.metrics().retries(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_write_waits_for_retry_after() {
    let orchestrator = orchestrator();
    let log = AttemptLog::default();

    let executed = orchestrator
        .execute_with_resilience(
            CallOptions::write("act_1", "adsets.create").idempotency_key("adset-1"),
            || async {
                if log.record() == 1 {
                    Err(Failure::Classified(
                        ClassifiedError::new(ErrorKind::RateLimited, "Too many calls")
                            .with_retry_after_ms(Some(1500)),
                    ))
                } else {
                    Ok(json!({"id": "adset_1"}))
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(executed.attempts, 2);
    let gaps = log.gaps();
    assert!(gaps[0] >= Duration::from_millis(1500));
    assert!(gaps[0] < Duration::from_millis(1510));
}

#[tokio::test(start_paused = true)]
async fn test_upstream_rate_limit_uses_table_cooldown() {
    let orchestrator = orchestrator();
    let log = AttemptLog::default();

    orchestrator
        .execute_with_resilience(CallOptions::read("act_1", "insights.get"), || async {
            if log.record() == 1 {
                Err(upstream(
                    400,
                    json!({"error": {"code": 613, "error_subcode": 1487742}}),
                ))
            } else {
                Ok(json!({}))
            }
        })
        .await
        .unwrap();

    assert!(log.gaps()[0] >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_user_limit_gives_up_after_two_retries() {
    let orchestrator = orchestrator();
    let calls = AtomicU32::new(0);

    let error = orchestrator
        .execute_with_resilience(CallOptions::read("act_1", "ads.list"), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(upstream(400, json!({"error": {"code": 17, "message": "User request limit reached"}})))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let classified = error.classified().unwrap();
    assert_eq!(classified.kind, ErrorKind::UserLimit);
    assert_eq!(classified.attempts, 3);
    assert!(error.to_string().contains("after 3 attempts"));
}

#[tokio::test(start_paused = true)]
async fn test_auth_expired_propagates_immediately() {
    let orchestrator = orchestrator();
    let calls = AtomicU32::new(0);

    let error = orchestrator
        .execute_with_resilience(CallOptions::read("act_1", "me"), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(upstream(401, json!({"error": {"code": 190, "message": "Session has expired"}})))
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let envelope = error.to_envelope();
    assert_eq!(envelope.code, "META_AUTH_EXPIRED");
    assert!(!envelope.retryable);
    assert_eq!(envelope.message, "[META_AUTH_EXPIRED] Session has expired");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_write_is_not_resent() {
    let orchestrator = orchestrator();
    let calls = AtomicU32::new(0);
    let options = CallOptions::write("act_1", "campaigns.create").idempotency_key("camp-42");

    for _ in 0..3 {
        let executed = orchestrator
            .execute_with_resilience(options.clone(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"id": "camp_42"}))
            })
            .await
            .unwrap();
        assert_eq!(executed.result, json!({"id": "camp_42"}));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_not_cached() {
    let orchestrator = orchestrator();
    let calls = AtomicU32::new(0);
    let options = CallOptions::write("act_1", "campaigns.create").idempotency_key("camp-43");

    let failed = orchestrator
        .execute_with_resilience(options.clone(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(upstream(400, json!({"error": {"code": 100}})))
        })
        .await;
    assert!(failed.is_err());

    let retried = orchestrator
        .execute_with_resilience(options, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"id": "camp_43"}))
        })
        .await
        .unwrap();

    assert!(!retried.cached);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff_keeps_last_error() {
    let orchestrator = orchestrator();
    let token = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        })
    };

    let error = orchestrator
        .execute_with_resilience(
            CallOptions::read("act_1", "campaigns.list").cancellation(token),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(server_error())
            },
        )
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match error {
        AdsError::Cancelled {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 1);
            let last = last_error.unwrap();
            assert_eq!(last.kind, ErrorKind::ServerError);
            assert_eq!(last.http_status, Some(500));
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_write_is_surfaced_without_executing() {
    let orchestrator = orchestrator();
    for _ in 0..20 {
        orchestrator.rate_limiter().check_rate_limit("act_1", true).unwrap();
    }
    let calls = AtomicU32::new(0);

    let error = orchestrator
        .execute_with_resilience(
            CallOptions::write("act_1", "ads.create").idempotency_key("ad-1"),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            },
        )
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let envelope = error.to_envelope();
    assert_eq!(envelope.code, "META_RATE_LIMITED");
    assert!(envelope.retryable);
    assert_eq!(envelope.retry_after_ms, Some(300_000));
    assert!(orchestrator.idempotency().get("ad-1").is_none());
}
