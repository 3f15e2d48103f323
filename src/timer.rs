//! The public face of the library: sessions in, reports out

use crate::clock::{Clock, SystemClock};
use crate::config::TxTimerConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::reporter::{GroupReport, PassOutcome, Reporter};
use crate::session::{self, ImplicitSession, TxGuard, TxToken};
use crate::sink::{LineSink, TracingSink};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL: Lazy<TxTimer> = Lazy::new(|| match TxTimerConfig::from_env() {
    Ok(config) => match config.validate() {
        Ok(()) => TxTimer::assemble(config, Arc::new(TracingSink), Arc::new(SystemClock)),
        Err(e) => {
            warn!("invalid TXTIMER_* configuration, using defaults: {}", e);
            TxTimer::assemble(
                TxTimerConfig::default(),
                Arc::new(TracingSink),
                Arc::new(SystemClock),
            )
        }
    },
    Err(e) => {
        warn!("unreadable TXTIMER_* configuration, using defaults: {}", e);
        TxTimer::assemble(
            TxTimerConfig::default(),
            Arc::new(TracingSink),
            Arc::new(SystemClock),
        )
    }
});

/// Process-wide timer configured from `TXTIMER_*` environment variables
///
/// Falls back to defaults (with a warning) when the environment is invalid.
pub fn global() -> &'static TxTimer {
    &GLOBAL
}

/// Records named transaction durations and reports on them periodically
///
/// # Example
///
/// ```
/// use txtimer::{TxTimer, TxTimerConfig};
///
/// let timer = TxTimer::new(TxTimerConfig::default()).unwrap();
///
/// // Thread-bound
/// timer.start("db", "select");
/// timer.stop();
///
/// // Token-based, may cross threads
/// let token = timer.enter("http", "GET /users");
/// timer.exit(token, 0);
///
/// assert_eq!(timer.registry().series_count(), 2);
/// timer.shutdown();
/// ```
pub struct TxTimer {
    id: u64,
    enabled: bool,
    clock: Arc<dyn Clock>,
    reporter: Arc<Reporter>,
}

impl std::fmt::Debug for TxTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxTimer")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("reporter", &self.reporter)
            .finish()
    }
}

impl TxTimer {
    /// Timer reporting through `tracing` on the system clock
    pub fn new(config: TxTimerConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(TracingSink), Arc::new(SystemClock))
    }

    /// Timer reporting to `sink` on the system clock
    pub fn with_sink(config: TxTimerConfig, sink: Arc<dyn LineSink>) -> Result<Self> {
        Self::with_parts(config, sink, Arc::new(SystemClock))
    }

    /// Timer with every collaborator supplied
    pub fn with_parts(
        config: TxTimerConfig,
        sink: Arc<dyn LineSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, sink, clock))
    }

    /// Timer configured from `TXTIMER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(TxTimerConfig::from_env()?)
    }

    fn assemble(config: TxTimerConfig, sink: Arc<dyn LineSink>, clock: Arc<dyn Clock>) -> Self {
        let enabled = config.enabled;
        let reporter = Reporter::new(config, sink, Arc::clone(&clock));
        Self {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            enabled,
            clock,
            reporter,
        }
    }

    /// Open a thread-bound session for (group, name)
    ///
    /// If this thread already has one open, the older one is counted as a
    /// duplicate start on its own series and replaced.
    pub fn start(&self, group: &str, name: &str) {
        if !self.enabled {
            return;
        }
        let series = self.reporter.registry().resolve(group, name);
        series.begin();
        let replaced = session::open_implicit(
            self.id,
            ImplicitSession {
                series,
                start_millis: self.clock.now_millis(),
            },
        );
        if let Some(previous) = replaced {
            previous.series.note_duplicate_start();
            warn!(
                group = previous.series.group(),
                name = previous.series.name(),
                "start() called again before stop(); previous session abandoned"
            );
        }
    }

    /// Close this thread's open session
    ///
    /// With nothing open this only bumps the missing-stop count. That count
    /// belongs to this timer (its reporter), not to the process: it is
    /// process-wide only for the shared [`global()`] instance.
    pub fn stop(&self) {
        if !self.enabled {
            return;
        }
        match session::close_implicit(self.id) {
            Some(open) => {
                let now = self.clock.now_millis();
                open.series.complete(now, now - open.start_millis);
            }
            None => {
                let total = self.reporter.note_missing_stop();
                warn!(total, "stop() called without a matching start()");
            }
        }
    }

    /// Open an explicit session
    pub fn enter(&self, group: &str, name: &str) -> TxToken {
        if !self.enabled {
            return TxToken::inert();
        }
        let series = self.reporter.registry().resolve(group, name);
        series.begin();
        TxToken::new(series, self.clock.now_millis())
    }

    /// Close an explicit session. A non-zero `result_code` counts as a failure.
    pub fn exit(&self, token: TxToken, result_code: i32) {
        token.finish(self.clock.now_millis(), result_code);
    }

    /// Open an explicit session that closes itself when dropped
    pub fn guard(&self, group: &str, name: &str) -> TxGuard {
        TxGuard::new(self.enter(group, name), Arc::clone(&self.clock))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether passes can still run and emit reports
    pub fn can_produce_metrics(&self) -> bool {
        self.enabled && !self.reporter.is_shutdown()
    }

    /// Whether the calling thread holds an open `start()` session
    pub fn has_open_session(&self) -> bool {
        session::has_implicit(self.id)
    }

    /// `stop()` calls on this timer that found no open session
    pub fn missing_stop_count(&self) -> u64 {
        self.reporter.missing_stop_count()
    }

    pub fn registry(&self) -> &Registry {
        self.reporter.registry()
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Run one aggregation pass immediately
    pub fn report_now(&self) -> PassOutcome {
        self.reporter.run_pass()
    }

    /// Unfiltered structured view of the current window
    pub fn snapshot(&self) -> Vec<GroupReport> {
        self.reporter.snapshot()
    }

    /// [`TxTimer::snapshot`] as pretty-printed JSON
    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Stop the background worker; recording keeps working but no more
    /// passes are scheduled
    pub fn shutdown(&self) {
        self.reporter.shutdown();
    }
}

impl Drop for TxTimer {
    fn drop(&mut self) {
        self.reporter.shutdown();
    }
}
