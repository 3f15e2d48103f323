//! Timer configuration
//!
//! Values come from defaults, a TOML file, or `TXTIMER_*` environment
//! variables. [`TxTimerConfig::validate`] is applied by [`crate::TxTimer::new`];
//! the lower-level components accept any value so they can be driven with
//! edge settings in tests.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Smallest accepted reporting interval, in minutes
pub const MIN_REPORT_INTERVAL_MINUTES: u32 = 2;
/// Largest accepted reporting interval, in minutes
pub const MAX_REPORT_INTERVAL_MINUTES: u32 = 60;
/// Extra ring slots beyond the reporting interval
///
/// Absorbs window edge effects and jitter in the reporter's cadence.
pub const RING_SURPLUS_SLOTS: usize = 6;

/// Configuration for a [`crate::TxTimer`]
///
/// # Example
/// ```
/// use txtimer::TxTimerConfig;
///
/// let config = TxTimerConfig::default();
/// assert_eq!(config.report_interval_minutes, 5);
/// assert_eq!(config.ring_length(), 11);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxTimerConfig {
    /// Master switch. A disabled timer turns every call into a no-op.
    pub enabled: bool,

    /// Width of the reporting window and the reporter's cadence.
    ///
    /// Default: 5 minutes, bounds [2, 60]
    pub report_interval_minutes: u32,

    /// Cadence of full, unfiltered passes. `None` disables them.
    pub report_all_interval_minutes: Option<u32>,

    /// Lines per flushed report block
    ///
    /// Default: 20
    pub page_lines: usize,

    /// Number of striped locks guarding group creation
    pub ring_stripe_count: usize,

    /// Number of striped locks guarding transaction creation
    pub registry_stripe_count: usize,

    /// Compare-and-swap attempts for a min/max update before it is dropped
    ///
    /// Default: 10
    pub max_update_attempts: u32,

    /// Report a transaction when its window average reaches this (ms)
    pub threshold_avg_ms: Option<i64>,

    /// Report a transaction when its window maximum reaches this (ms)
    pub threshold_max_ms: Option<i64>,

    /// Report a transaction when its window minimum reaches this (ms)
    pub threshold_min_ms: Option<i64>,

    /// Length of one reporter sleep increment (ms). The shutdown flag is
    /// checked once per increment.
    ///
    /// Default: 60000
    pub reporter_tick_ms: u64,
}

impl Default for TxTimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval_minutes: 5,
            report_all_interval_minutes: None,
            page_lines: 20,
            ring_stripe_count: 16,
            registry_stripe_count: 16,
            max_update_attempts: 10,
            threshold_avg_ms: None,
            threshold_max_ms: None,
            threshold_min_ms: None,
            reporter_tick_ms: 60_000,
        }
    }
}

impl TxTimerConfig {
    /// Configuration with every call turned into a no-op
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Number of buckets in each transaction's ring
    pub fn ring_length(&self) -> usize {
        self.report_interval_minutes as usize + RING_SURPLUS_SLOTS
    }

    /// Whether any filter threshold is configured
    pub fn has_thresholds(&self) -> bool {
        self.threshold_avg_ms.is_some()
            || self.threshold_max_ms.is_some()
            || self.threshold_min_ms.is_some()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.report_interval_minutes;
        if !(MIN_REPORT_INTERVAL_MINUTES..=MAX_REPORT_INTERVAL_MINUTES).contains(&interval) {
            return Err(ConfigError::IntervalOutOfRange {
                value: interval,
                min: MIN_REPORT_INTERVAL_MINUTES,
                max: MAX_REPORT_INTERVAL_MINUTES,
            });
        }

        if let Some(all) = self.report_all_interval_minutes {
            if all < interval {
                return Err(ConfigError::InvalidReportAllInterval { all, interval });
            }
        }

        if self.page_lines == 0 {
            return Err(ConfigError::ZeroPageLines);
        }
        if self.ring_stripe_count == 0 {
            return Err(ConfigError::ZeroStripeCount("ring_stripe_count"));
        }
        if self.registry_stripe_count == 0 {
            return Err(ConfigError::ZeroStripeCount("registry_stripe_count"));
        }
        if self.max_update_attempts == 0 {
            return Err(ConfigError::ZeroUpdateAttempts);
        }
        if self.reporter_tick_ms == 0 {
            return Err(ConfigError::ZeroReporterTick);
        }

        Ok(())
    }

    /// Parse configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by `TXTIMER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from a variable lookup (e.g. the process environment)
    ///
    /// An empty value or `off` clears an optional setting.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "TXTIMER_ENABLED")? {
            self.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "TXTIMER_REPORT_INTERVAL_MINUTES")? {
            self.report_interval_minutes = v;
        }
        if let Some(v) = parse_optional_var(&lookup, "TXTIMER_REPORT_ALL_INTERVAL_MINUTES")? {
            self.report_all_interval_minutes = v;
        }
        if let Some(v) = parse_var(&lookup, "TXTIMER_PAGE_LINES")? {
            self.page_lines = v;
        }
        if let Some(v) = parse_var(&lookup, "TXTIMER_RING_STRIPE_COUNT")? {
            self.ring_stripe_count = v;
        }
        if let Some(v) = parse_var(&lookup, "TXTIMER_REGISTRY_STRIPE_COUNT")? {
            self.registry_stripe_count = v;
        }
        if let Some(v) = parse_var(&lookup, "TXTIMER_MAX_UPDATE_ATTEMPTS")? {
            self.max_update_attempts = v;
        }
        if let Some(v) = parse_optional_var(&lookup, "TXTIMER_THRESHOLD_AVG_MS")? {
            self.threshold_avg_ms = v;
        }
        if let Some(v) = parse_optional_var(&lookup, "TXTIMER_THRESHOLD_MAX_MS")? {
            self.threshold_max_ms = v;
        }
        if let Some(v) = parse_optional_var(&lookup, "TXTIMER_THRESHOLD_MIN_MS")? {
            self.threshold_min_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "TXTIMER_REPORTER_TICK_MS")? {
            self.reporter_tick_ms = v;
        }
        Ok(self)
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value: raw,
            }),
    }
}

fn parse_optional_var<T, F>(lookup: &F, var: &str) -> Result<Option<Option<T>>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() || raw.trim().eq_ignore_ascii_case("off") => {
            Ok(Some(None))
        }
        Some(_) => parse_var(lookup, var).map(|v| v.map(Some)),
    }
}
