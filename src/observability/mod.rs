//! Observability infrastructure for the Meta Ads client.
//!
//! Provides logging setup, redaction helpers and metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, redact_token, LogConfig, LogFormat};
pub use metrics::{
    create_metrics_collector, LatencyHistogram, LatencyStats, MetricsCollector, MetricsSnapshot,
    OperationMetrics,
};
