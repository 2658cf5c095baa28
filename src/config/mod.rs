//! Configuration management for the Meta Ads client.
//!
//! Supports configuration via:
//! - Explicit values
//! - Environment variables
//! - Builder pattern

use crate::errors::{AdsError, AdsResult, ConfigurationError};
use crate::observability::{redact_token, LogConfig, LogFormat};
use crate::resilience::{IdempotencyConfig, RateLimitTier, ResilienceConfig, RetryConfig};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use url::Url;

/// Configuration for the Meta Ads client
#[derive(Clone)]
pub struct AdsConfig {
    /// Access token for the Marketing API
    pub(crate) access_token: Option<SecretString>,
    /// Base URL for API requests
    pub base_url: String,
    /// Graph API version prefix, e.g. `v21.0`
    pub api_version: String,
    /// Request timeout
    pub timeout: Duration,
    /// Rate limit tier applied to accounts without an override
    pub rate_limit_tier: RateLimitTier,
    /// Retry backoff configuration
    pub retry: RetryConfig,
    /// Idempotency cache configuration
    pub idempotency: IdempotencyConfig,
    /// Logging configuration
    pub logging: LogConfig,
}

impl std::fmt::Debug for AdsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsConfig")
            .field(
                "access_token",
                &self
                    .access_token
                    .as_ref()
                    .map(|t| redact_token(t.expose_secret())),
            )
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .field("rate_limit_tier", &self.rate_limit_tier)
            .field("idempotency", &self.idempotency)
            .field("logging", &self.logging)
            .finish()
    }
}

impl Default for AdsConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            base_url: crate::DEFAULT_BASE_URL.to_string(),
            api_version: crate::DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
            rate_limit_tier: RateLimitTier::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl AdsConfig {
    /// Create a new configuration builder
    pub fn builder() -> AdsConfigBuilder {
        AdsConfigBuilder::new()
    }

    /// Create configuration from environment variables
    ///
    /// Reads:
    /// - `META_ACCESS_TOKEN` - Marketing API access token (required)
    /// - `META_BASE_URL` - API base URL
    /// - `META_API_VERSION` - Graph API version
    /// - `META_REQUEST_TIMEOUT_MS` - Request timeout in milliseconds
    /// - `META_RATE_LIMIT_TIER` - `development` or `standard`
    /// - `META_IDEMPOTENCY_TTL_MS` - Idempotency cache TTL in milliseconds
    /// - `META_DEBUG` - Enable debug logging
    /// - `META_LOG_FORMAT` - `text` or `json`
    pub fn from_env() -> AdsResult<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable lookup
    pub fn from_env_with<F>(lookup: F) -> AdsResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = AdsConfigBuilder::new();

        if let Some(token) = lookup("META_ACCESS_TOKEN") {
            builder = builder.access_token(&token);
        }

        if let Some(url) = lookup("META_BASE_URL") {
            builder = builder.base_url(&url)?;
        }

        if let Some(version) = lookup("META_API_VERSION") {
            builder = builder.api_version(&version);
        }

        if let Some(timeout) = lookup("META_REQUEST_TIMEOUT_MS") {
            let ms = parse_env_number("META_REQUEST_TIMEOUT_MS", &timeout)?;
            builder = builder.timeout(Duration::from_millis(ms));
        }

        if let Some(tier) = lookup("META_RATE_LIMIT_TIER") {
            builder = builder.rate_limit_tier(tier.parse()?);
        }

        if let Some(ttl) = lookup("META_IDEMPOTENCY_TTL_MS") {
            let ms = parse_env_number("META_IDEMPOTENCY_TTL_MS", &ttl)?;
            builder = builder.idempotency_ttl(Duration::from_millis(ms));
        }

        if let Some(debug) = lookup("META_DEBUG") {
            builder = builder.debug(matches!(
                debug.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ));
        }

        if let Some(format) = lookup("META_LOG_FORMAT") {
            builder = builder.log_format(format.parse()?);
        }

        builder.build()
    }

    /// Base URL joined with the API version
    pub fn versioned_base_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let version = self.api_version.trim_matches('/');
        if version.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, version)
        }
    }

    /// Whether an access token is configured
    pub fn has_access_token(&self) -> bool {
        self.access_token.is_some()
    }

    /// Resilience configuration derived from this configuration
    pub fn resilience(&self) -> ResilienceConfig {
        ResilienceConfig::new()
            .rate_limiter(self.rate_limit_tier.config())
            .retry(self.retry.clone())
            .idempotency(self.idempotency.clone())
    }

    /// Validate the configuration
    pub fn validate(&self) -> AdsResult<()> {
        if self.access_token.is_none() {
            return Err(AdsError::Configuration(ConfigurationError::MissingToken));
        }

        Url::parse(&self.base_url).map_err(|e| ConfigurationError::InvalidConfiguration {
            message: format!("Invalid URL: {}", e),
        })?;

        if self.timeout.is_zero() {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "Request timeout must be positive".to_string(),
            }
            .into());
        }

        if self.idempotency.max_entries == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "Idempotency cache must hold at least one entry".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

fn parse_env_number(name: &str, value: &str) -> Result<u64, ConfigurationError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigurationError::EnvVar {
            name: name.to_string(),
            message: format!("expected a non-negative integer, got {:?} ({})", value, e),
        })
}

/// Builder for AdsConfig
#[derive(Default)]
pub struct AdsConfigBuilder {
    config: AdsConfig,
}

impl AdsConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            config: AdsConfig::default(),
        }
    }

    /// Set the access token
    pub fn access_token(mut self, token: &str) -> Self {
        self.config.access_token = Some(SecretString::new(token.to_string()));
        self
    }

    /// Set the base URL
    pub fn base_url(mut self, url: &str) -> Result<Self, ConfigurationError> {
        Url::parse(url).map_err(|e| ConfigurationError::InvalidConfiguration {
            message: format!("Invalid URL: {}", e),
        })?;
        self.config.base_url = url.to_string();
        Ok(self)
    }

    /// Set the API version
    pub fn api_version(mut self, version: &str) -> Self {
        self.config.api_version = version.to_string();
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the rate limit tier
    pub fn rate_limit_tier(mut self, tier: RateLimitTier) -> Self {
        self.config.rate_limit_tier = tier;
        self
    }

    /// Set the retry configuration
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the idempotency cache configuration
    pub fn idempotency(mut self, idempotency: IdempotencyConfig) -> Self {
        self.config.idempotency = idempotency;
        self
    }

    /// Set the idempotency TTL
    pub fn idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.config.idempotency.ttl = ttl;
        self
    }

    /// Enable debug logging
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.logging.debug = debug;
        self
    }

    /// Set the log output format
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.logging.format = format;
        self
    }

    /// Build the configuration
    pub fn build(self) -> AdsResult<AdsConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation (for testing)
    pub fn build_unchecked(self) -> AdsConfig {
        self.config
    }
}
