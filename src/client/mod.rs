//! Meta Ads client implementation.
//!
//! Routes every Marketing API request through the resilience orchestrator.

use crate::config::AdsConfig;
use crate::errors::{AdsError, AdsResult, Failure, ResponseError};
use crate::observability::MetricsCollector;
use crate::resilience::{
    CallOptions, Executed, IdempotencyCache, RateLimiter, ResilienceOrchestrator,
};
use crate::transport::{ApiRequest, HttpTransport, ReqwestTransport};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Main Meta Ads client
pub struct AdsClient {
    config: Arc<AdsConfig>,
    transport: Arc<dyn HttpTransport>,
    orchestrator: Arc<ResilienceOrchestrator>,
    sweeper: Option<JoinHandle<()>>,
}

impl AdsClient {
    /// Create a client with the reqwest transport
    pub fn new(config: AdsConfig) -> AdsResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a client with a custom transport.
    ///
    /// The idempotency sweeper is only started when called inside a Tokio
    /// runtime.
    pub fn with_transport(config: AdsConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let orchestrator = Arc::new(ResilienceOrchestrator::with_config(config.resilience()));

        let sweeper = tokio::runtime::Handle::try_current()
            .ok()
            .map(|_| IdempotencyCache::spawn_sweeper(orchestrator.idempotency()));

        debug!(
            base_url = %config.versioned_base_url(),
            tier = %config.rate_limit_tier,
            "Created Meta Ads client"
        );

        Self {
            config: Arc::new(config),
            transport,
            orchestrator,
            sweeper,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &AdsConfig {
        &self.config
    }

    /// Get the resilience orchestrator
    pub fn orchestrator(&self) -> &Arc<ResilienceOrchestrator> {
        &self.orchestrator
    }

    /// Get the rate limiter
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.orchestrator.rate_limiter()
    }

    /// Get the metrics collector
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.orchestrator.metrics()
    }

    /// Execute a request, returning the raw JSON result
    pub async fn execute(&self, request: ApiRequest, options: CallOptions) -> AdsResult<Executed> {
        let account_key = options.account_key.clone();
        let (transport, rate_limiter, account): (&dyn HttpTransport, &RateLimiter, &str) = (
            self.transport.as_ref(),
            self.orchestrator.rate_limiter().as_ref(),
            account_key.as_str(),
        );

        self.orchestrator
            .execute_with_resilience(options, move || {
                let request = request.clone();
                async move {
                    let response = match transport.perform(request).await {
                        Ok(response) => response,
                        Err(error) => return Err(Failure::Transport(error)),
                    };
                    rate_limiter.observe_usage_headers(account, &response.headers);

                    if !response.is_success() {
                        return Err(Failure::Response(response));
                    }
                    if response.body.iter().all(u8::is_ascii_whitespace) {
                        return Ok(Value::Null);
                    }
                    response.json::<Value>().map_err(|e| Failure::Malformed {
                        status: response.status,
                        message: e.to_string(),
                    })
                }
            })
            .await
    }

    /// Execute a request and decode the result
    pub async fn send<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        options: CallOptions,
    ) -> AdsResult<T> {
        let executed = self.execute(request, options).await?;
        serde_json::from_value(executed.result)
            .map_err(|e| AdsError::Response(ResponseError::from(e)))
    }

    /// GET a path charged to an account
    pub async fn get<T: DeserializeOwned>(
        &self,
        account_key: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> AdsResult<T> {
        let request = query
            .iter()
            .fold(ApiRequest::get(path), |request, (name, value)| {
                request.query(*name, *value)
            });
        self.send(request, CallOptions::read(account_key, format!("GET {}", path)))
            .await
    }

    /// POST a JSON body, deduplicated by an optional idempotency key
    pub async fn post<T: DeserializeOwned>(
        &self,
        account_key: &str,
        path: &str,
        body: Value,
        idempotency_key: Option<&str>,
    ) -> AdsResult<T> {
        let mut options = CallOptions::write(account_key, format!("POST {}", path));
        if let Some(key) = idempotency_key {
            options = options.idempotency_key(key);
        }
        self.send(ApiRequest::post(path, body), options).await
    }

    /// DELETE a path, deduplicated by an optional idempotency key
    pub async fn delete<T: DeserializeOwned>(
        &self,
        account_key: &str,
        path: &str,
        idempotency_key: Option<&str>,
    ) -> AdsResult<T> {
        let mut options = CallOptions::write(account_key, format!("DELETE {}", path));
        if let Some(key) = idempotency_key {
            options = options.idempotency_key(key);
        }
        self.send(ApiRequest::delete(path), options).await
    }
}

impl Drop for AdsClient {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for AdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsClient")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
