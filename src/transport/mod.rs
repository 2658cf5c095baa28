//! HTTP transport layer for the Meta Ads client.
//!
//! The resilience layer only needs "send method + path + body, receive
//! status + headers + body"; [`HttpTransport`] is that seam.

use crate::config::AdsConfig;
use crate::errors::{AdsError, AdsResult, ConfigurationError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use reqwest::{Client, ClientBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};

/// HTTP transport trait for making API requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform a single request; no retries happen at this level
    async fn perform(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Outbound request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Path relative to the versioned base URL, e.g. `act_123/campaigns`
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// JSON body
    pub body: Option<serde_json::Value>,
    /// Per-request timeout override
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    /// Create a request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Create a POST request
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// Create a DELETE request
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set the JSON body
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the request mutates upstream state
    pub fn is_write(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

/// Raw response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ApiResponse {
    /// Create a response with no headers
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Default HTTP transport implementation using reqwest
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    access_token: Option<SecretString>,
    default_timeout: Duration,
}

impl ReqwestTransport {
    /// Create a transport from configuration
    pub fn new(config: &AdsConfig) -> AdsResult<Self> {
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                AdsError::Configuration(ConfigurationError::InvalidConfiguration {
                    message: format!("Failed to build HTTP client: {}", e),
                })
            })?;

        Ok(Self {
            client,
            base_url: config.versioned_base_url(),
            access_token: config.access_token.clone(),
            default_timeout: config.timeout,
        })
    }

    /// Build the full URL for a path
    pub fn build_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    async fn perform(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut builder = self
            .client
            .request(request.method, self.build_url(&request.path))
            .timeout(timeout);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(TransportError::from)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(TransportError::from)?;

        debug!(status, bytes = body.len(), "Received response");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("base_url", &self.base_url)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
