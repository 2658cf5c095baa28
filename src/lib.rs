//! Meta Marketing API Client
//!
//! Resilient client for the Meta Marketing API with:
//! - Per-account rate limiting with decaying usage scores
//! - Error classification with stable error codes
//! - Retry with exponential backoff or server-specified waits
//! - Idempotency cache for write operations
//! - Structured logging to stderr and in-process metrics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use meta_ads_client::CallOptions;
//! use meta_ads_client::transport::ApiRequest;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = meta_ads_client::create_client_from_env()?;
//!
//!     let created = client
//!         .execute(
//!             ApiRequest::post("act_123/campaigns", json!({"name": "Spring sale"})),
//!             CallOptions::write("act_123", "campaigns.create").idempotency_key("spring-1"),
//!         )
//!         .await?;
//!
//!     println!("Campaign: {} (cached: {})", created.result, created.cached);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod client;
pub mod config;
pub mod errors;
pub mod transport;

// Resilience
pub mod resilience;

// Observability
pub mod observability;

// Testing utilities
pub mod mocks;

// Tests
#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use client::AdsClient;
pub use config::{AdsConfig, AdsConfigBuilder};
pub use errors::{AdsError, AdsResult, ClassifiedError, ErrorEnvelope, ErrorKind};
pub use resilience::{CallOptions, Executed, RateLimitTier, ResilienceOrchestrator};

/// Default base URL for the Graph API
pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com";

/// Default Graph API version
pub const DEFAULT_API_VERSION: &str = "v21.0";

/// Default request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default idempotency TTL in milliseconds (24 hours)
pub const DEFAULT_IDEMPOTENCY_TTL_MS: u64 = 86_400_000;

/// Create a Meta Ads client with the given configuration
pub fn create_client(config: AdsConfig) -> AdsResult<AdsClient> {
    AdsClient::new(config)
}

/// Create a Meta Ads client from environment variables
///
/// See [`AdsConfig::from_env`] for the variables read. Logging is
/// initialised from the same configuration.
pub fn create_client_from_env() -> AdsResult<AdsClient> {
    let config = AdsConfig::from_env()?;
    observability::init_logging(&config.logging);
    create_client(config)
}
