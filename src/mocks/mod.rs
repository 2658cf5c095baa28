//! Mock implementations for testing.
//!
//! Provides a queue-driven transport so the resilience layer can be exercised
//! without a network.

use crate::errors::TransportError;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Mock response configuration
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Response body
    pub body: String,
    /// Delay before response
    pub delay_ms: Option<u64>,
    /// Transport error to return instead
    pub error: Option<TransportError>,
}

impl MockResponse {
    /// Create a response with a status and raw body
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay_ms: None,
            error: None,
        }
    }

    /// Create a successful JSON response
    pub fn json<T: Serialize>(data: &T) -> Self {
        let body = serde_json::to_string(data).unwrap_or_else(|_| "null".to_string());
        Self::status(200, body)
    }

    /// Create a successful response with raw body
    pub fn ok(body: impl Into<String>) -> Self {
        Self::status(200, body)
    }

    /// Create an upstream error response
    pub fn upstream_error(status: u16, code: i64, subcode: Option<i64>) -> Self {
        let mut error = json!({
            "message": format!("Upstream error {}", code),
            "type": "OAuthException",
            "code": code,
            "fbtrace_id": "AbCdEf123",
        });
        if let Some(subcode) = subcode {
            error["error_subcode"] = json!(subcode);
        }
        Self::status(status, json!({ "error": error }).to_string())
    }

    /// Create an HTTP 429 with a `Retry-After` header in seconds
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::status(429, "").with_header(RETRY_AFTER, HeaderValue::from(retry_after_secs))
    }

    /// Create a transport failure
    pub fn transport_error(error: TransportError) -> Self {
        Self {
            error: Some(error),
            ..Self::status(0, "")
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Add delay to response
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = Some(ms);
        self
    }

    fn into_response(self) -> ApiResponse {
        self.headers.into_iter().fold(
            ApiResponse::new(self.status, Bytes::from(self.body)),
            |response, (name, value)| response.with_header(name, value),
        )
    }
}

/// Recorded request for verification
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Request body
    pub body: Option<Value>,
}

/// Mock HTTP transport for testing
#[derive(Default)]
pub struct MockHttpTransport {
    /// Queue of responses to return
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    /// Recorded requests
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// Default response if queue is empty
    default_response: Option<MockResponse>,
}

impl MockHttpTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response to the queue
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.lock().push_back(response);
        self
    }

    /// Add multiple responses
    pub fn add_responses(self, responses: impl IntoIterator<Item = MockResponse>) -> Self {
        self.responses.lock().extend(responses);
        self
    }

    /// Add a JSON response
    pub fn add_json_response<T: Serialize>(self, data: &T) -> Self {
        self.add_response(MockResponse::json(data))
    }

    /// Set default response when queue is empty
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = Some(response);
        self
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Get the last recorded request
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().last().cloned()
    }

    /// Number of requests performed
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Get remaining response count
    pub fn remaining_responses(&self) -> usize {
        self.responses.lock().len()
    }

    fn next_response(&self) -> Option<MockResponse> {
        self.responses
            .lock()
            .pop_front()
            .or_else(|| self.default_response.clone())
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn perform(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().push(RecordedRequest {
            method: request.method.to_string(),
            path: request.path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
        });

        let Some(response) = self.next_response() else {
            return Err(TransportError::ConnectionFailed {
                message: format!("No mock response queued for {}", request.path),
            });
        };

        if let Some(delay) = response.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match response.error.clone() {
            Some(error) => Err(error),
            None => Ok(response.into_response()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_order_and_recording() {
        let mock = MockHttpTransport::new()
            .add_response(MockResponse::upstream_error(500, 2, None))
            .add_json_response(&json!({"id": "1"}));

        let first = mock.perform(ApiRequest::get("act_1/campaigns")).await.unwrap();
        let second = mock.perform(ApiRequest::get("act_1/campaigns")).await.unwrap();

        assert_eq!(first.status, 500);
        assert_eq!(second.json::<Value>().unwrap(), json!({"id": "1"}));
        assert_eq!(mock.request_count(), 2);
        assert_eq!(mock.remaining_responses(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_fails() {
        let mock = MockHttpTransport::new();
        let result = mock.perform(ApiRequest::get("me")).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let mock = MockHttpTransport::new().add_response(MockResponse::rate_limited(3));
        let response = mock.perform(ApiRequest::get("me")).await.unwrap();

        assert_eq!(response.status, 429);
        assert_eq!(response.headers.get(RETRY_AFTER).unwrap(), "3");
    }
}
