//! Error types for the Meta Ads client.
//!
//! Every failure that reaches a caller is one of four things: a configuration
//! problem, a [`ClassifiedError`] (upstream, transport or local rate limit),
//! a cooperative cancellation, or a success payload that could not be decoded.
//! [`AdsError::to_envelope`] turns any of them into the structured result
//! handed back to tool callers.

pub mod classifier;

pub use classifier::{ErrorClassifier, Failure, UpstreamError, UpstreamErrorBody};

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for Meta Ads operations
pub type AdsResult<T> = Result<T, AdsError>;

/// Root error type for the Meta Ads integration
#[derive(Error, Debug)]
pub enum AdsError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Classified upstream, transport or rate-limit failure
    #[error("{0}")]
    Api(#[from] ClassifiedError),

    /// The caller cancelled the operation between attempts
    #[error("Operation cancelled after {attempts} attempt(s){}", last_error_suffix(.last_error))]
    Cancelled {
        /// Attempts made before cancellation was observed
        attempts: u32,
        /// Last failure observed before cancellation, if any
        last_error: Option<Box<ClassifiedError>>,
    },

    /// Response decoding error
    #[error("Response error: {0}")]
    Response(#[from] ResponseError),
}

fn last_error_suffix(last_error: &Option<Box<ClassifiedError>>) -> String {
    match last_error {
        Some(error) => format!("; last error: {}", error),
        None => String::new(),
    }
}

impl AdsError {
    /// Get the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "META_CONFIG",
            Self::Api(error) => error.kind.code(),
            Self::Cancelled { .. } => "META_CANCELLED",
            Self::Response(_) => "META_RESPONSE",
        }
    }

    /// Check if the caller may resubmit this operation
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api(error) => error.retryable,
            _ => false,
        }
    }

    /// Get retry-after duration if known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api(error) => error.retry_after(),
            _ => None,
        }
    }

    /// Get the classified error, if this is one
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Api(error) => Some(error),
            Self::Cancelled { last_error, .. } => last_error.as_deref(),
            _ => None,
        }
    }

    /// Build the user-visible structured failure
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.error_code(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            retry_after_ms: match self {
                Self::Api(error) => error.retry_after_ms,
                _ => None,
            },
        }
    }
}

/// Classification of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream or local rate limit hit
    RateLimited,
    /// Access token expired or invalidated
    AuthExpired,
    /// Token lacks the permission for this call
    PermissionDenied,
    /// Invalid parameters
    Validation,
    /// Application-level request limit reached
    ApplicationLimit,
    /// User-level request limit reached
    UserLimit,
    /// Upstream 5xx or HTTP 429 processing error
    ServerError,
    /// Transport-level failure (reset, timeout, DNS, abort)
    NetworkTransient,
    /// Anything not matched above
    Unknown,
}

impl ErrorKind {
    /// Stable error code exposed to callers
    pub fn code(self) -> &'static str {
        match self {
            Self::RateLimited => "META_RATE_LIMITED",
            Self::AuthExpired => "META_AUTH_EXPIRED",
            Self::PermissionDenied => "META_PERMISSION_DENIED",
            Self::Validation => "META_VALIDATION",
            Self::ApplicationLimit => "META_APPLICATION_LIMIT",
            Self::UserLimit => "META_USER_LIMIT",
            Self::ServerError => "META_SERVER_ERROR",
            Self::NetworkTransient => "META_NETWORK",
            Self::Unknown => "META_UNKNOWN",
        }
    }

    /// Whether a failure of this kind may be retried.
    ///
    /// `ServerError` is only retryable for 5xx and 429 statuses.
    pub fn is_retryable(self, http_status: Option<u16>) -> bool {
        match self {
            Self::RateLimited | Self::ApplicationLimit | Self::UserLimit | Self::NetworkTransient => {
                true
            }
            Self::ServerError => http_status.map_or(true, |s| s >= 500 || s == 429),
            Self::AuthExpired | Self::PermissionDenied | Self::Validation | Self::Unknown => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Where a classified error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorOrigin {
    /// Returned by the upstream API
    #[default]
    Upstream,
    /// Raised by the HTTP transport before a response arrived
    Transport,
    /// Rejected locally before any network call
    LocalRateLimiter,
}

/// A failure reduced to a stable kind, retryability and suggested wait
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    /// Error kind
    pub kind: ErrorKind,
    /// Human-readable message (never raw upstream JSON)
    pub message: String,
    /// HTTP status, when a response was received
    pub http_status: Option<u16>,
    /// Derived from `kind` and `http_status`
    pub retryable: bool,
    /// Server or classifier specified wait; overrides computed backoff
    pub retry_after_ms: Option<u64>,
    /// Upstream error code
    pub upstream_code: Option<i64>,
    /// Upstream error subcode
    pub upstream_subcode: Option<i64>,
    /// Upstream error type (e.g. `OAuthException`)
    pub upstream_type: Option<String>,
    /// Source of the error
    pub origin: ErrorOrigin,
    /// Attempts made when the error was surfaced
    pub attempts: u32,
    /// Time spent across all attempts
    pub elapsed_ms: Option<u64>,
}

impl ClassifiedError {
    /// Create a new classified error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            retryable: kind.is_retryable(None),
            retry_after_ms: None,
            upstream_code: None,
            upstream_subcode: None,
            upstream_type: None,
            origin: ErrorOrigin::default(),
            attempts: 1,
            elapsed_ms: None,
        }
    }

    /// Set the HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self.retryable = self.kind.is_retryable(self.http_status);
        self
    }

    /// Set the suggested wait
    pub fn with_retry_after_ms(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    /// Attach upstream diagnostics
    pub fn with_upstream(
        mut self,
        code: Option<i64>,
        subcode: Option<i64>,
        error_type: Option<String>,
    ) -> Self {
        self.upstream_code = code;
        self.upstream_subcode = subcode;
        self.upstream_type = error_type;
        self
    }

    /// Set the origin
    pub fn with_origin(mut self, origin: ErrorOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Record how many attempts were made and how long they took
    pub fn annotate(mut self, attempts: u32, elapsed: Duration) -> Self {
        self.attempts = attempts;
        self.elapsed_ms = Some(elapsed.as_millis() as u64);
        self
    }

    /// Get the suggested wait as a duration
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)?;
        if self.attempts > 1 {
            write!(f, " (after {} attempts", self.attempts)?;
            if let Some(ms) = self.elapsed_ms {
                write!(f, " over {}ms", ms)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClassifiedError {}

/// User-visible structured failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEnvelope {
    /// Stable error code
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
    /// Whether resubmitting may succeed
    pub retryable: bool,
    /// Suggested wait before resubmitting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// Missing access token
    #[error("Access token is missing")]
    MissingToken,

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Environment variable could not be parsed
    #[error("Environment variable {name}: {message}")]
    EnvVar {
        /// Variable name
        name: String,
        /// Error message
        message: String,
    },
}

/// Transport-level failures raised before a response was received
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// Connection reset by peer
    #[error("Connection reset: {message}")]
    ConnectionReset {
        /// Error message
        message: String,
    },

    /// Connection could not be established
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        /// Error message
        message: String,
    },

    /// DNS resolution failed
    #[error("DNS resolution failed: {message}")]
    DnsFailure {
        /// Error message
        message: String,
    },

    /// Request aborted
    #[error("Request aborted")]
    Aborted,

    /// Request could not be built or sent at all
    #[error("Invalid request: {message}")]
    Request {
        /// Error message
        message: String,
    },
}

impl TransportError {
    /// Whether this failure is a transient network condition
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Request { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return TransportError::Timeout;
        }
        if err.is_builder() {
            return TransportError::Request {
                message: err.to_string(),
            };
        }
        if let Some(kind) = io_error_kind(&err) {
            use std::io::ErrorKind as Io;
            match kind {
                Io::ConnectionReset | Io::BrokenPipe | Io::UnexpectedEof => {
                    return TransportError::ConnectionReset {
                        message: err.to_string(),
                    }
                }
                Io::ConnectionAborted | Io::Interrupted => return TransportError::Aborted,
                _ => {}
            }
        }
        if err.is_connect() {
            TransportError::ConnectionFailed {
                message: err.to_string(),
            }
        } else {
            TransportError::ConnectionReset {
                message: err.to_string(),
            }
        }
    }
}

fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}

/// Response decoding errors
#[derive(Error, Debug)]
pub enum ResponseError {
    /// JSON deserialization error
    #[error("Deserialization error: {message}")]
    DeserializationError {
        /// Error message
        message: String,
    },
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        ResponseError::DeserializationError {
            message: err.to_string(),
        }
    }
}
