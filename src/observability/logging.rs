//! Logging setup and sensitive data redaction.
//!
//! Events are emitted through `tracing`; [`init_logging`] installs a
//! subscriber that writes to stderr so stdout stays reserved for the
//! tool-calling protocol stream.

use crate::errors::ConfigurationError;
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(ConfigurationError::InvalidConfiguration {
                message: format!("Unknown log format: {}", other),
            }),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Lower the default level to `debug`
    pub debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            debug: false,
        }
    }
}

impl LogConfig {
    /// Creates a new log configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default level
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Sets the output format
    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables debug logging
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Filter directive applied when `RUST_LOG` is unset
    pub fn default_directive(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.level
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };

    result.is_ok()
}

/// Redact token from a string, preserving prefix for debugging
pub fn redact_token(token: &str) -> String {
    match token.get(..8) {
        Some(prefix) if token.len() > 8 => format!("{}...[REDACTED]", prefix),
        _ => "[REDACTED]".to_string(),
    }
}
