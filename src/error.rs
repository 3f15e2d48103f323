//! Error types for txtimer
//!
//! Protocol anomalies (duplicate start, missing stop) are not errors: they are
//! counted and logged, and never reach the instrumented caller. What remains
//! are configuration mistakes, which fail fast at construction, and
//! per-transaction aggregation failures, which the reporter logs and skips.

use thiserror::Error;

/// Invalid or unreadable configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("report_interval_minutes must be in [{min}, {max}], got {value}")]
    IntervalOutOfRange { value: u32, min: u32, max: u32 },

    #[error("report_all_interval_minutes ({all}) must be >= report_interval_minutes ({interval})")]
    InvalidReportAllInterval { all: u32, interval: u32 },

    #[error("page_lines must be >= 1")]
    ZeroPageLines,

    #[error("{0} must be >= 1")]
    ZeroStripeCount(&'static str),

    #[error("max_update_attempts must be >= 1")]
    ZeroUpdateAttempts,

    #[error("reporter_tick_ms must be >= 1")]
    ZeroReporterTick,

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: String, value: String },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while summarising one transaction's buckets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    #[error("window sum overflowed for {group}/{name}")]
    Overflow { group: String, name: String },
}

/// Top-level error for timer construction and control
#[derive(Error, Debug)]
pub enum TxTimerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn reporter worker: {0}")]
    WorkerSpawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for txtimer operations
pub type Result<T> = std::result::Result<T, TxTimerError>;
