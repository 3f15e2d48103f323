//! txtimer - lock-free transaction timing statistics
//!
//! Records the duration of named transactions into rolling per-minute
//! buckets and periodically emits a human-readable report of throughput,
//! average/min/max latency, and anomaly counts.
//!
//! The hot path (`start`/`stop`, `enter`/`exit`) is atomics only. A single
//! lazily spawned reporter thread aggregates the buckets of the last
//! `report_interval_minutes` and writes the report to a [`LineSink`].

pub mod bucket;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod registry;
pub mod reporter;
pub mod series;
pub mod session;
pub mod sink;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TxTimerConfig;
pub use error::{ConfigError, ReportError, Result, TxTimerError};
pub use reporter::{GroupReport, PassOutcome, ReportLine, Reporter, ReporterState};
pub use session::{TxGuard, TxToken};
pub use sink::{LineSink, MemorySink, StdoutSink, TracingSink};
pub use timer::{global, TxTimer};
