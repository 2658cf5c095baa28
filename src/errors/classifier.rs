//! Error classification.
//!
//! Reduces transport failures, upstream error bodies and malformed responses
//! to a [`ClassifiedError`]. Classification never looks at message text: the
//! decision is driven by the upstream `code`/`error_subcode` pair, the HTTP
//! status and the `Retry-After` header.

use super::{ClassifiedError, ErrorKind, ErrorOrigin, TransportError};
use crate::transport::ApiResponse;
use chrono::{DateTime, Utc};
use http::header::RETRY_AFTER;
use http::HeaderMap;
use serde::Deserialize;

/// Default wait for a 429 without a usable `Retry-After` header
pub const DEFAULT_RATE_LIMIT_RETRY_MS: u64 = 60_000;

/// Cooldown for the five-minute ads management window
pub const FIVE_MINUTE_COOLDOWN_MS: u64 = 300_000;

/// Cooldown for the one-minute ad account window
pub const ONE_MINUTE_COOLDOWN_MS: u64 = 60_000;

const CODE_APPLICATION_LIMIT: i64 = 4;
const CODE_PERMISSION_DENIED: i64 = 10;
const CODE_USER_LIMIT: i64 = 17;
const CODE_INVALID_PARAMETER: i64 = 100;
const CODE_AUTH_EXPIRED: i64 = 190;
const CODE_PERMISSION_ERROR: i64 = 200;
const CODE_API_TOO_MANY_CALLS: i64 = 613;
const CODE_ADS_MANAGEMENT_LIMIT: i64 = 80004;

const SUBCODE_FIVE_MINUTE_WINDOW: i64 = 2_446_079;
const SUBCODE_ONE_MINUTE_WINDOW: i64 = 1_487_742;

/// (code, subcode, cooldown) combinations that are always rate limits
const RATE_LIMIT_COMBINATIONS: &[(i64, i64, u64)] = &[
    (CODE_USER_LIMIT, SUBCODE_FIVE_MINUTE_WINDOW, FIVE_MINUTE_COOLDOWN_MS),
    (CODE_ADS_MANAGEMENT_LIMIT, SUBCODE_FIVE_MINUTE_WINDOW, FIVE_MINUTE_COOLDOWN_MS),
    (CODE_API_TOO_MANY_CALLS, SUBCODE_ONE_MINUTE_WINDOW, ONE_MINUTE_COOLDOWN_MS),
];

/// Subcodes that carry their own cooldown regardless of code
const SUBCODE_WINDOWS: &[(i64, u64)] = &[
    (SUBCODE_FIVE_MINUTE_WINDOW, FIVE_MINUTE_COOLDOWN_MS),
    (SUBCODE_ONE_MINUTE_WINDOW, ONE_MINUTE_COOLDOWN_MS),
];

/// A raw failure awaiting classification
#[derive(Debug, Clone)]
pub enum Failure {
    /// No response was received
    Transport(TransportError),
    /// A non-success response was received
    Response(ApiResponse),
    /// A success status whose body could not be decoded
    Malformed {
        /// HTTP status
        status: u16,
        /// Decoder message
        message: String,
    },
    /// Already classified; passed through unchanged
    Classified(ClassifiedError),
}

impl From<TransportError> for Failure {
    fn from(err: TransportError) -> Self {
        Failure::Transport(err)
    }
}

impl From<ApiResponse> for Failure {
    fn from(response: ApiResponse) -> Self {
        Failure::Response(response)
    }
}

impl From<ClassifiedError> for Failure {
    fn from(err: ClassifiedError) -> Self {
        Failure::Classified(err)
    }
}

/// Upstream error envelope: `{"error": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamErrorBody {
    /// The error object
    pub error: UpstreamError,
}

/// Upstream error object
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamError {
    /// Error message
    #[serde(default)]
    pub message: Option<String>,
    /// Error type, e.g. `OAuthException`
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    /// Error code
    pub code: i64,
    /// Error subcode
    #[serde(default)]
    pub error_subcode: Option<i64>,
    /// User-facing message, when provided
    #[serde(default)]
    pub error_user_msg: Option<String>,
    /// Upstream trace identifier
    #[serde(default)]
    pub fbtrace_id: Option<String>,
}

/// Stateless classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Create a new classifier
    pub fn new() -> Self {
        Self
    }

    /// Classify a failure against the current wall clock
    pub fn classify(&self, failure: &Failure) -> ClassifiedError {
        self.classify_at(failure, Utc::now())
    }

    /// Classify a failure, resolving HTTP-date `Retry-After` values against `now`
    pub fn classify_at(&self, failure: &Failure, now: DateTime<Utc>) -> ClassifiedError {
        match failure {
            Failure::Transport(err) => classify_transport(err),
            Failure::Response(response) => classify_response(response, now),
            Failure::Malformed { status, message } => {
                let kind = if *status >= 500 {
                    ErrorKind::ServerError
                } else {
                    ErrorKind::Unknown
                };
                ClassifiedError::new(kind, format!("Malformed response: {}", message))
                    .with_status(*status)
            }
            Failure::Classified(err) => err.clone(),
        }
    }
}

fn classify_transport(err: &TransportError) -> ClassifiedError {
    let kind = if err.is_transient() {
        ErrorKind::NetworkTransient
    } else {
        ErrorKind::Unknown
    };
    ClassifiedError::new(kind, err.to_string()).with_origin(ErrorOrigin::Transport)
}

fn classify_response(response: &ApiResponse, now: DateTime<Utc>) -> ClassifiedError {
    let status = response.status;
    let header_wait = retry_after_from_headers(&response.headers, now);

    match serde_json::from_slice::<UpstreamErrorBody>(&response.body) {
        Ok(body) => classify_upstream(status, body.error, header_wait),
        Err(_) => classify_unstructured(status, header_wait),
    }
}

fn classify_upstream(status: u16, error: UpstreamError, header_wait: Option<u64>) -> ClassifiedError {
    let code = error.code;
    let subcode = error.error_subcode;

    let (kind, default_wait) = match rate_limit_window(code, subcode) {
        Some(wait) => (ErrorKind::RateLimited, Some(wait)),
        None => {
            let kind = match code {
                CODE_AUTH_EXPIRED => ErrorKind::AuthExpired,
                CODE_PERMISSION_DENIED | CODE_PERMISSION_ERROR => ErrorKind::PermissionDenied,
                CODE_INVALID_PARAMETER => ErrorKind::Validation,
                CODE_APPLICATION_LIMIT => ErrorKind::ApplicationLimit,
                CODE_USER_LIMIT => ErrorKind::UserLimit,
                _ if status >= 500 || status == 429 => ErrorKind::ServerError,
                _ => ErrorKind::Unknown,
            };
            (kind, None)
        }
    };

    let message = error
        .error_user_msg
        .or(error.message)
        .unwrap_or_else(|| format!("Upstream error code {}", code));

    ClassifiedError::new(kind, message)
        .with_status(status)
        .with_retry_after_ms(header_wait.or(default_wait))
        .with_upstream(Some(code), subcode, error.error_type)
}

fn classify_unstructured(status: u16, header_wait: Option<u64>) -> ClassifiedError {
    if status == 429 {
        return ClassifiedError::new(ErrorKind::RateLimited, "Rate limited (HTTP 429)")
            .with_status(status)
            .with_retry_after_ms(Some(header_wait.unwrap_or(DEFAULT_RATE_LIMIT_RETRY_MS)));
    }

    let kind = if status >= 500 {
        ErrorKind::ServerError
    } else {
        ErrorKind::Unknown
    };
    ClassifiedError::new(kind, format!("Unexpected HTTP {} response", status))
        .with_status(status)
        .with_retry_after_ms(header_wait)
}

/// Cooldown for rate-limit code/subcode pairs, checked combinations first
fn rate_limit_window(code: i64, subcode: Option<i64>) -> Option<u64> {
    let subcode = subcode?;
    RATE_LIMIT_COMBINATIONS
        .iter()
        .find(|(c, s, _)| *c == code && *s == subcode)
        .map(|(_, _, wait)| *wait)
        .or_else(|| {
            SUBCODE_WINDOWS
                .iter()
                .find(|(s, _)| *s == subcode)
                .map(|(_, wait)| *wait)
        })
}

fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, now)
}

/// Parse a `Retry-After` value (delta seconds or HTTP-date) into milliseconds
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let millis = (date - now).num_milliseconds();
    Some(millis.max(0) as u64)
}
