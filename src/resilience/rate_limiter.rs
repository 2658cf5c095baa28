//! Per-account rate limiter with linearly decaying usage scores.
//!
//! Every checked call adds a cost to the account's score before the request
//! is sent. Scores decay lazily on access, so no timer ever touches shared
//! state. Once a call pushes the score strictly over the tier maximum the
//! account is blocked for the tier's block time.

use crate::errors::{ClassifiedError, ConfigurationError, ErrorKind, ErrorOrigin};
use http::HeaderMap;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upstream header reporting per-account utilisation
pub const AD_ACCOUNT_USAGE_HEADER: &str = "x-ad-account-usage";

/// Longest block an upstream usage report can impose
pub const MAX_UPSTREAM_BLOCK: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for rate limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Score above which calls are rejected
    pub max_score: f64,
    /// Time for a score to decay linearly to zero
    pub decay_time: Duration,
    /// How long an account stays blocked after exceeding `max_score`
    pub block_time: Duration,
    /// Cost of a read call
    pub read_call_score: f64,
    /// Cost of a write call
    pub write_call_score: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimitTier::default().config()
    }
}

impl RateLimiterConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum score
    pub fn max_score(mut self, score: f64) -> Self {
        self.max_score = score;
        self
    }

    /// Set the decay window
    pub fn decay_time(mut self, duration: Duration) -> Self {
        self.decay_time = duration;
        self
    }

    /// Set the block duration
    pub fn block_time(mut self, duration: Duration) -> Self {
        self.block_time = duration;
        self
    }

    /// Set the read call cost
    pub fn read_call_score(mut self, score: f64) -> Self {
        self.read_call_score = score;
        self
    }

    /// Set the write call cost
    pub fn write_call_score(mut self, score: f64) -> Self {
        self.write_call_score = score;
        self
    }

    fn call_score(&self, is_write: bool) -> f64 {
        if is_write {
            self.write_call_score
        } else {
            self.read_call_score
        }
    }
}

/// Marketing API access tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RateLimitTier {
    /// Development access: low ceiling, long block
    #[default]
    Development,
    /// Standard access
    Standard,
}

impl RateLimitTier {
    /// Limits for this tier
    pub fn config(self) -> RateLimiterConfig {
        match self {
            Self::Development => RateLimiterConfig {
                max_score: 60.0,
                decay_time: Duration::from_secs(300),
                block_time: Duration::from_secs(300),
                read_call_score: 1.0,
                write_call_score: 3.0,
            },
            Self::Standard => RateLimiterConfig {
                max_score: 9000.0,
                decay_time: Duration::from_secs(300),
                block_time: Duration::from_secs(60),
                read_call_score: 1.0,
                write_call_score: 3.0,
            },
        }
    }
}

impl FromStr for RateLimitTier {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "development_access" => Ok(Self::Development),
            "standard" | "standard_access" => Ok(Self::Standard),
            other => Err(ConfigurationError::InvalidConfiguration {
                message: format!("Unknown rate limit tier: {}", other),
            }),
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Standard => f.write_str("standard"),
        }
    }
}

/// Usage state for one account
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageRecord {
    /// Accumulated cost as of `last_updated`
    pub score: f64,
    /// When `score` was last decayed
    pub last_updated: Instant,
    /// End of the current block window
    pub blocked_until: Option<Instant>,
}

impl UsageRecord {
    fn new(now: Instant) -> Self {
        Self {
            score: 0.0,
            last_updated: now,
            blocked_until: None,
        }
    }

    /// Bring the score forward to `now`
    fn decay(&mut self, now: Instant, decay_time: Duration) {
        let elapsed = now.saturating_duration_since(self.last_updated);
        self.score = decayed_score(self.score, elapsed, decay_time);
        self.last_updated = now;
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    fn remaining_block(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Linear decay of `score` over `decay_time`; never negative
pub fn decayed_score(score: f64, elapsed: Duration, decay_time: Duration) -> f64 {
    if decay_time.is_zero() {
        return 0.0;
    }
    let remaining = 1.0 - elapsed.as_secs_f64() / decay_time.as_secs_f64();
    (score * remaining.max(0.0)).max(0.0)
}

/// Body of the `x-ad-account-usage` header
#[derive(Debug, Clone, Deserialize)]
struct AccountUsage {
    #[serde(default)]
    acc_id_util_pct: Option<f64>,
    #[serde(default)]
    reset_time_duration: Option<u64>,
    #[serde(default)]
    ads_api_access_tier: Option<String>,
}

#[derive(Default)]
struct State {
    records: HashMap<String, UsageRecord>,
    overrides: HashMap<String, RateLimiterConfig>,
}

enum Rejection {
    Blocked(Duration),
    Exceeded { score: f64, block: Duration },
}

/// Rate limiter keyed by account
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<State>,
}

impl RateLimiter {
    /// Create a rate limiter with the default tier
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    /// Create a rate limiter with custom limits
    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Create a rate limiter for a tier
    pub fn for_tier(tier: RateLimitTier) -> Self {
        Self::with_config(tier.config())
    }

    /// Default limits
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn config_for<'a>(&'a self, state: &'a State, key: &str) -> &'a RateLimiterConfig {
        state.overrides.get(key).unwrap_or(&self.config)
    }

    /// Reserve budget for one call, or fail with `RateLimited`.
    ///
    /// The cost is recorded even when the call is rejected for exceeding the
    /// limit; calls rejected inside an active block add nothing.
    pub fn check_rate_limit(&self, key: &str, is_write: bool) -> Result<(), ClassifiedError> {
        let now = Instant::now();

        let outcome = {
            let mut state = self.state.lock();
            let config = self.config_for(&state, key).clone();
            let record = state
                .records
                .entry(key.to_string())
                .or_insert_with(|| UsageRecord::new(now));
            record.decay(now, config.decay_time);

            if let Some(remaining) = record.remaining_block(now) {
                Err(Rejection::Blocked(remaining))
            } else {
                record.score += config.call_score(is_write);
                if record.score > config.max_score {
                    record.blocked_until = Some(now + config.block_time);
                    Err(Rejection::Exceeded {
                        score: record.score,
                        block: config.block_time,
                    })
                } else {
                    Ok(record.score)
                }
            }
        };

        match outcome {
            Ok(score) => {
                debug!(account = key, score, is_write, "Rate limit check passed");
                Ok(())
            }
            Err(Rejection::Blocked(remaining)) => {
                warn!(
                    account = key,
                    retry_after_ms = remaining.as_millis() as u64,
                    "Account is blocked by the local rate limiter"
                );
                Err(rejection(
                    format!("Account {} is rate limited", key),
                    remaining,
                ))
            }
            Err(Rejection::Exceeded { score, block }) => {
                warn!(
                    account = key,
                    score,
                    block_ms = block.as_millis() as u64,
                    "Rate limit exceeded, blocking account"
                );
                Err(rejection(
                    format!("Rate limit exceeded for account {}", key),
                    block,
                ))
            }
        }
    }

    /// Decayed score for an account; 0 for unknown accounts
    pub fn current_score(&self, key: &str) -> f64 {
        self.usage(key).map(|record| record.score).unwrap_or(0.0)
    }

    /// Budget left before the next call would be rejected
    pub fn remaining_capacity(&self, key: &str) -> f64 {
        let now = Instant::now();
        let state = self.state.lock();
        let config = self.config_for(&state, key);
        let score = state
            .records
            .get(key)
            .map(|record| {
                let elapsed = now.saturating_duration_since(record.last_updated);
                decayed_score(record.score, elapsed, config.decay_time)
            })
            .unwrap_or(0.0);
        (config.max_score - score).max(0.0)
    }

    /// Whether the account is inside a block window
    pub fn is_account_blocked(&self, key: &str) -> bool {
        self.usage(key)
            .is_some_and(|record| record.blocked_until.is_some())
    }

    /// Clear score and block state for one account
    pub fn reset_account(&self, key: &str) {
        self.state.lock().records.remove(key);
        debug!(account = key, "Rate limit state reset");
    }

    /// Decayed snapshot of an account's usage record
    pub fn usage(&self, key: &str) -> Option<UsageRecord> {
        let now = Instant::now();
        let state = self.state.lock();
        let decay_time = self.config_for(&state, key).decay_time;
        state.records.get(key).map(|record| {
            let mut record = *record;
            record.decay(now, decay_time);
            record
        })
    }

    /// Apply a tier's limits to one account
    pub fn set_account_tier(&self, key: &str, tier: RateLimitTier) {
        self.state
            .lock()
            .overrides
            .insert(key.to_string(), tier.config());
    }

    /// Limits in effect for an account
    pub fn account_config(&self, key: &str) -> RateLimiterConfig {
        let state = self.state.lock();
        self.config_for(&state, key).clone()
    }

    /// Feed upstream utilisation back into the local score.
    ///
    /// The local score is raised to the reported share of `max_score` and
    /// never lowered. At 100 % utilisation with a reset window the account is
    /// blocked for that window.
    pub fn observe_usage_headers(&self, key: &str, headers: &HeaderMap) {
        let Some(raw) = headers
            .get(AD_ACCOUNT_USAGE_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };

        let usage: AccountUsage = match serde_json::from_str(raw) {
            Ok(usage) => usage,
            Err(e) => {
                debug!(account = key, error = %e, "Ignoring unparseable usage header");
                return;
            }
        };

        if let Some(tier) = usage
            .ads_api_access_tier
            .as_deref()
            .and_then(|tier| tier.parse::<RateLimitTier>().ok())
        {
            self.set_account_tier(key, tier);
        }

        let Some(pct) = usage.acc_id_util_pct else {
            return;
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        let config = self.config_for(&state, key).clone();
        let record = state
            .records
            .entry(key.to_string())
            .or_insert_with(|| UsageRecord::new(now));
        record.decay(now, config.decay_time);

        let reported = (pct / 100.0 * config.max_score).clamp(0.0, config.max_score);
        record.score = record.score.max(reported);

        if pct >= 100.0 {
            if let Some(reset) = usage.reset_time_duration.filter(|secs| *secs > 0) {
                let window = Duration::from_secs(reset).min(MAX_UPSTREAM_BLOCK);
                if let Some(until) = now.checked_add(window) {
                    record.blocked_until =
                        Some(record.blocked_until.map_or(until, |b| b.max(until)));
                }
            }
        }
        let score = record.score;
        drop(state);

        debug!(account = key, util_pct = pct, score, "Applied upstream usage");
    }
}

fn rejection(message: String, wait: Duration) -> ClassifiedError {
    ClassifiedError::new(ErrorKind::RateLimited, message)
        .with_retry_after_ms(Some(wait.as_millis() as u64))
        .with_origin(ErrorOrigin::LocalRateLimiter)
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("accounts", &self.state.lock().records.len())
            .finish()
    }
}
