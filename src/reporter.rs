//! Background aggregation and report formatting
//!
//! # Lifecycle
//!
//! ```text
//!   Idle --wake()--> Scheduled --interval elapsed--> Aggregating --pass done--> Idle
//!                        |                                                   ^
//!                        +---------------- shutdown ------------------------+
//! ```
//!
//! `begin`/`complete` on any series call [`WakeSignal::wake`]. Only the
//! Idle -> Scheduled transition spawns a worker thread, so there is never more
//! than one aggregation loop alive and an idle timer holds no thread at all.
//! The worker sleeps in `reporter_tick_ms` increments, checking the shutdown
//! flag after each, until `report_interval_minutes` have passed since the last
//! completed pass. It then runs exactly one pass and exits.
//!
//! # Pass
//!
//! The window is `[floor(now) - (interval + 1) min, floor(now))`. Each series
//! sums the bucket snapshots inside the window, discarding any bucket that
//! rotated mid-read, is empty, or still holds data from an older lap. Lines
//! are sorted by window average (descending) within each group, filtered by
//! thresholds, and paged into blocks of at most `page_lines` transaction
//! lines; a duplicate-start line stays in the block of its transaction.

use crate::clock::{floor_minute, Clock, MINUTE_MS};
use crate::config::TxTimerConfig;
use crate::error::{ReportError, TxTimerError};
use crate::registry::Registry;
use crate::series::{TransactionSeries, WakeSignal};
use crate::sink::LineSink;
use chrono::{Local, TimeZone};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Above this many lifetime completions the estimate moves at a fixed weight
const FIXED_WEIGHT_AFTER: u64 = 10_000;
/// Smallest weight a window gets in the smoothed estimate
const MIN_WEIGHT: f64 = 0.03;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const AGGREGATING: u8 = 2;

/// Where the reporter worker currently is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    Idle,
    Scheduled,
    Aggregating,
}

impl ReporterState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            SCHEDULED => ReporterState::Scheduled,
            AGGREGATING => ReporterState::Aggregating,
            _ => ReporterState::Idle,
        }
    }
}

/// Sums over the buckets of one reporting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowTotals {
    pub count: i64,
    pub total_elapsed: i64,
    pub max_elapsed: Option<i64>,
    pub min_elapsed: Option<i64>,
}

impl WindowTotals {
    /// Integer average in ms, 0 for an empty window
    pub fn average(&self) -> i64 {
        if self.count > 0 {
            self.total_elapsed / self.count
        } else {
            0
        }
    }
}

/// One transaction's figures for one pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportLine {
    pub group: String,
    pub name: String,
    pub window_count: i64,
    pub window_avg_ms: i64,
    pub window_max_ms: i64,
    pub window_min_ms: i64,
    pub lifetime_finished: u64,
    pub lifetime_running: i64,
    pub lifetime_failures: u64,
    pub estimate_avg_ms: f64,
    pub new_duplicate_starts: u64,
    pub lifetime_duplicate_starts: u64,
}

/// All lines for one group over one window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReport {
    pub group: String,
    pub window_start_millis: i64,
    pub window_end_millis: i64,
    pub interval_minutes: u32,
    pub lines: Vec<ReportLine>,
}

/// What a pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassOutcome {
    /// Whether this was an unfiltered (report-all) pass
    pub full: bool,
    /// Blocks handed to the sink, anomaly blocks included
    pub blocks: usize,
    /// Transaction lines emitted
    pub lines: usize,
    /// Transactions skipped because their summary failed
    pub skipped: usize,
}

/// Sum the consistent, non-empty buckets of `series` inside `[start, end)`
///
/// Fails with [`ReportError::Overflow`] when a bucket total saturated or the
/// window sums leave `i64`.
pub fn summarize_window(
    series: &TransactionSeries,
    start_millis: i64,
    end_millis: i64,
) -> Result<WindowTotals, ReportError> {
    let overflow = || ReportError::Overflow {
        group: series.group().to_string(),
        name: series.name().to_string(),
    };

    let mut totals = WindowTotals::default();
    for bucket in series.buckets_in_window(start_millis, end_millis) {
        let snap = bucket.snapshot();
        if !snap.is_consistent() || snap.count <= 0 {
            continue;
        }
        // Slot not touched since an earlier lap
        if snap.slot_start < start_millis || snap.slot_start >= end_millis {
            continue;
        }
        if snap.is_saturated() {
            return Err(overflow());
        }

        totals.count = totals.count.checked_add(snap.count).ok_or_else(overflow)?;
        totals.total_elapsed = totals
            .total_elapsed
            .checked_add(snap.total_elapsed)
            .ok_or_else(overflow)?;
        if snap.max_elapsed != crate::bucket::MAX_SENTINEL {
            totals.max_elapsed = Some(totals.max_elapsed.map_or(snap.max_elapsed, |m| {
                m.max(snap.max_elapsed)
            }));
        }
        if snap.min_elapsed != crate::bucket::MIN_SENTINEL {
            totals.min_elapsed = Some(totals.min_elapsed.map_or(snap.min_elapsed, |m| {
                m.min(snap.min_elapsed)
            }));
        }
    }
    Ok(totals)
}

/// Fold one window's average into the long-lived estimate
///
/// The first window sets the estimate outright. After that the window's
/// weight is its share of all completions, clamped to [0.03, 1.0], and fixed
/// at 0.03 once more than 10,000 completions have been seen.
pub fn smooth_estimate(
    previous: Option<f64>,
    window_avg: f64,
    window_count: i64,
    lifetime_finished: u64,
) -> f64 {
    let Some(previous) = previous else {
        return window_avg;
    };
    let weight = if lifetime_finished > FIXED_WEIGHT_AFTER {
        MIN_WEIGHT
    } else if lifetime_finished == 0 {
        1.0
    } else {
        (window_count as f64 / lifetime_finished as f64).clamp(MIN_WEIGHT, 1.0)
    };
    previous * (1.0 - weight) + window_avg * weight
}

/// Block title without the page suffix
pub fn format_title(group: &str, start_millis: i64, end_millis: i64) -> String {
    format!(
        "Group ({}) Time ({} - {})",
        group,
        format_timestamp(start_millis),
        format_timestamp(end_millis)
    )
}

/// Local wall-clock minute, falling back to raw millis if out of range
pub fn format_timestamp(millis: i64) -> String {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// One transaction line in the text report
pub fn format_line(line: &ReportLine, interval_minutes: u32) -> String {
    format!(
        "{} > last {} min ( cnt:{}, avg:{}ms, max:{}ms, min:{}ms ) total ( cnt:{}, ing:{}, est-avg: {}ms )",
        line.name,
        interval_minutes,
        line.window_count,
        line.window_avg_ms,
        line.window_max_ms,
        line.window_min_ms,
        line.lifetime_finished,
        line.lifetime_running,
        line.estimate_avg_ms as i64
    )
}

/// Anomaly line: `ERROR!!! Times:<n>, <description>`
pub fn anomaly_line(times: u64, description: &str) -> String {
    format!("ERROR!!! Times:{}, {}", times, description)
}

/// Buffers lines under a title and flushes them a page at a time
///
/// Only transaction lines count toward `page_lines`. An anomaly line that
/// follows a transaction rides in the same block, so a page may hold more
/// than `page_lines` lines but never splits a transaction from its anomaly.
struct Pager<'a> {
    sink: &'a dyn LineSink,
    page_lines: usize,
    title: String,
    page: u32,
    buffer: Vec<String>,
    counted: usize,
    blocks: usize,
}

impl<'a> Pager<'a> {
    fn new(sink: &'a dyn LineSink, page_lines: usize) -> Self {
        Self {
            sink,
            page_lines: page_lines.max(1),
            title: String::new(),
            page: 0,
            buffer: Vec::new(),
            counted: 0,
            blocks: 0,
        }
    }

    fn push(&mut self, title: &str, line: String, anomaly: Option<String>) {
        if self.title != title {
            self.flush();
            self.title = title.to_string();
            self.page = 0;
        }
        self.buffer.push(line);
        self.buffer.extend(anomaly);
        self.counted += 1;
        if self.counted >= self.page_lines {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.page += 1;
        let mut block = Vec::with_capacity(self.buffer.len() + 1);
        block.push(format!("{}  Page {}", self.title, self.page));
        block.append(&mut self.buffer);
        self.sink.append(&block);
        self.counted = 0;
        self.blocks += 1;
    }

    fn finish(mut self) -> usize {
        self.flush();
        self.blocks
    }
}

/// Wake handle given to every series; cheap when a worker is already alive
struct ReporterWake {
    state: Arc<AtomicU8>,
    reporter: Weak<Reporter>,
}

impl WakeSignal for ReporterWake {
    fn wake(&self) {
        if self.state.load(Ordering::Acquire) != IDLE {
            return;
        }
        if let Some(reporter) = self.reporter.upgrade() {
            reporter.wake();
        }
    }
}

/// Periodic aggregator over a [`Registry`]
pub struct Reporter {
    registry: Arc<Registry>,
    config: TxTimerConfig,
    sink: Arc<dyn LineSink>,
    clock: Arc<dyn Clock>,

    state: Arc<AtomicU8>,
    shutdown: AtomicBool,
    wake_lock: Mutex<()>,
    wake_cv: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Reporter>,

    pass_lock: Mutex<()>,
    last_pass: AtomicI64,
    last_full_pass: AtomicI64,
    missing_stops: AtomicU64,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .field("missing_stops", &self.missing_stop_count())
            .finish()
    }
}

impl Reporter {
    /// Build a reporter together with the registry whose series wake it
    ///
    /// The config is used as given; [`TxTimerConfig::validate`] is the
    /// caller's business.
    pub fn new(
        config: TxTimerConfig,
        sink: Arc<dyn LineSink>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let now = clock.now_millis();
        let state = Arc::new(AtomicU8::new(IDLE));

        Arc::new_cyclic(|weak: &Weak<Reporter>| {
            let waker: Arc<dyn WakeSignal> = Arc::new(ReporterWake {
                state: Arc::clone(&state),
                reporter: weak.clone(),
            });
            let registry = Arc::new(Registry::new(
                config.ring_stripe_count.max(1),
                config.registry_stripe_count.max(1),
                config.ring_length(),
                config.max_update_attempts.max(1),
                waker,
            ));
            Reporter {
                registry,
                config,
                sink,
                clock,
                state,
                shutdown: AtomicBool::new(false),
                wake_lock: Mutex::new(()),
                wake_cv: Condvar::new(),
                worker: Mutex::new(None),
                self_ref: weak.clone(),
                pass_lock: Mutex::new(()),
                last_pass: AtomicI64::new(now),
                last_full_pass: AtomicI64::new(now),
                missing_stops: AtomicU64::new(0),
            }
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &TxTimerConfig {
        &self.config
    }

    pub fn state(&self) -> ReporterState {
        ReporterState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Count of `stop()` calls with no open session over this reporter's
    /// lifetime; never reset by a pass
    pub fn missing_stop_count(&self) -> u64 {
        self.missing_stops.load(Ordering::Acquire)
    }

    pub(crate) fn note_missing_stop(&self) -> u64 {
        self.missing_stops.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Schedule a worker unless one is already alive or we are shut down
    pub fn wake(&self) {
        if self.is_shutdown() {
            return;
        }
        if self
            .state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(e) = self.spawn_worker() {
            self.state.store(IDLE, Ordering::Release);
            warn!("{}", e);
        }
    }

    fn spawn_worker(&self) -> Result<(), TxTimerError> {
        let Some(reporter) = self.self_ref.upgrade() else {
            return Ok(());
        };
        let handle = thread::Builder::new()
            .name("txtimer-reporter".to_string())
            .spawn(move || reporter.run_worker())
            .map_err(TxTimerError::WorkerSpawn)?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn run_worker(&self) {
        info!("reporter worker started");
        let tick = Duration::from_millis(self.config.reporter_tick_ms.max(1));
        let interval_ms = i64::from(self.config.report_interval_minutes) * MINUTE_MS;

        loop {
            if self.is_shutdown() {
                info!("reporter worker stopping on shutdown");
                break;
            }
            let due = self.last_pass.load(Ordering::Acquire) + interval_ms;
            if self.clock.now_millis() >= due {
                self.state.store(AGGREGATING, Ordering::Release);
                let outcome = self.run_pass();
                debug!(?outcome, "reporter pass finished");
                break;
            }

            let mut guard = self.wake_lock.lock();
            if !self.is_shutdown() {
                self.wake_cv.wait_for(&mut guard, tick);
            }
        }

        self.state.store(IDLE, Ordering::Release);
        info!("reporter worker exited");
    }

    /// Stop the worker (if any) and refuse further wakes
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.wake_lock.lock();
            self.wake_cv.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        info!("reporter shut down");
    }

    /// Run one pass now, emitting to the sink
    pub fn run_pass(&self) -> PassOutcome {
        let _guard = self.pass_lock.lock();
        let now = self.clock.now_millis();
        let outcome = self.aggregate(now);
        self.last_pass.store(now, Ordering::Release);
        outcome
    }

    fn take_full_cycle(&self, now: i64) -> bool {
        let Some(minutes) = self.config.report_all_interval_minutes else {
            return false;
        };
        let last = self.last_full_pass.load(Ordering::Acquire);
        if now - last >= i64::from(minutes) * MINUTE_MS {
            self.last_full_pass.store(now, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn window(&self, now: i64) -> (i64, i64) {
        let end = floor_minute(now);
        let start = end - (i64::from(self.config.report_interval_minutes) + 1) * MINUTE_MS;
        (start, end)
    }

    fn aggregate(&self, now: i64) -> PassOutcome {
        let (start, end) = self.window(now);
        let full = self.take_full_cycle(now);
        let mut outcome = PassOutcome {
            full,
            ..Default::default()
        };

        let missing = self.missing_stop_count();
        if missing > 0 {
            self.sink.append(&[anomaly_line(
                missing,
                "stop() called without a matching start() on the same thread",
            )]);
            outcome.blocks += 1;
        }

        let mut pager = Pager::new(self.sink.as_ref(), self.config.page_lines);
        for group in self.registry.groups() {
            let title = format_title(group.name(), start, end);
            let mut lines = Vec::with_capacity(group.len());
            for series in group.series() {
                match self.summarize(&series, start, end) {
                    Ok(line) => lines.push(line),
                    Err(e) => {
                        warn!(group = group.name(), name = series.name(), "skipping transaction this pass: {}", e);
                        outcome.skipped += 1;
                    }
                }
            }
            sort_lines(&mut lines);

            for line in lines.iter().filter(|l| self.should_emit(l, full)) {
                let anomaly = (line.new_duplicate_starts > 0).then(|| {
                    anomaly_line(
                        line.lifetime_duplicate_starts,
                        &format!(
                            "start() called again for {}/{} before stop()",
                            line.group, line.name
                        ),
                    )
                });
                pager.push(
                    &title,
                    format_line(line, self.config.report_interval_minutes),
                    anomaly,
                );
                outcome.lines += 1;
            }
        }
        outcome.blocks += pager.finish();
        outcome
    }

    fn summarize(
        &self,
        series: &TransactionSeries,
        start: i64,
        end: i64,
    ) -> Result<ReportLine, ReportError> {
        let totals = summarize_window(series, start, end)?;
        let avg = totals.average();
        let lifetime_finished = series.lifetime_finished();
        let estimate = smooth_estimate(
            series.smoothed_estimate(),
            avg as f64,
            totals.count,
            lifetime_finished,
        );
        series.set_smoothed_estimate(estimate);
        let new_duplicates = series.take_new_duplicate_starts();
        Ok(build_line(series, &totals, estimate, new_duplicates, lifetime_finished))
    }

    fn should_emit(&self, line: &ReportLine, full: bool) -> bool {
        if full || !self.config.has_thresholds() || line.new_duplicate_starts > 0 {
            return true;
        }
        let has_data = line.window_count > 0;
        let reaches = |threshold: Option<i64>, value: i64, needs_data: bool| {
            threshold.is_some_and(|t| (has_data || !needs_data) && value >= t)
        };
        reaches(self.config.threshold_avg_ms, line.window_avg_ms, false)
            || reaches(self.config.threshold_max_ms, line.window_max_ms, true)
            || reaches(self.config.threshold_min_ms, line.window_min_ms, true)
    }

    /// Structured view of the current window, unfiltered
    ///
    /// Leaves the smoothed estimates and anomaly bookkeeping untouched.
    pub fn snapshot(&self) -> Vec<GroupReport> {
        let (start, end) = self.window(self.clock.now_millis());
        self.registry
            .groups()
            .into_iter()
            .map(|group| {
                let mut lines: Vec<ReportLine> = group
                    .series()
                    .iter()
                    .filter_map(|series| {
                        let totals = summarize_window(series, start, end).ok()?;
                        let lifetime_finished = series.lifetime_finished();
                        let estimate = smooth_estimate(
                            series.smoothed_estimate(),
                            totals.average() as f64,
                            totals.count,
                            lifetime_finished,
                        );
                        Some(build_line(
                            series,
                            &totals,
                            estimate,
                            series.pending_duplicate_starts(),
                            lifetime_finished,
                        ))
                    })
                    .collect();
                sort_lines(&mut lines);
                GroupReport {
                    group: group.name().to_string(),
                    window_start_millis: start,
                    window_end_millis: end,
                    interval_minutes: self.config.report_interval_minutes,
                    lines,
                }
            })
            .collect()
    }
}

fn build_line(
    series: &TransactionSeries,
    totals: &WindowTotals,
    estimate: f64,
    new_duplicate_starts: u64,
    lifetime_finished: u64,
) -> ReportLine {
    ReportLine {
        group: series.group().to_string(),
        name: series.name().to_string(),
        window_count: totals.count,
        window_avg_ms: totals.average(),
        window_max_ms: totals.max_elapsed.unwrap_or(0),
        window_min_ms: totals.min_elapsed.unwrap_or(0),
        lifetime_finished,
        lifetime_running: series.lifetime_running(),
        lifetime_failures: series.lifetime_failures(),
        estimate_avg_ms: estimate,
        new_duplicate_starts,
        lifetime_duplicate_starts: series.lifetime_duplicate_starts(),
    }
}

fn sort_lines(lines: &mut [ReportLine]) {
    lines.sort_by(|a, b| {
        b.window_avg_ms
            .cmp(&a.window_avg_ms)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sink::MemorySink;
    use std::time::Instant;

    const BASE_MINUTE: i64 = 1_000;

    fn setup(config: TxTimerConfig) -> (Arc<Reporter>, Arc<MemorySink>, Arc<ManualClock>) {
        let sink = Arc::new(MemorySink::new());
        let clock = Arc::new(ManualClock::new(BASE_MINUTE * MINUTE_MS + 5_000));
        let reporter = Reporter::new(config, sink.clone(), clock.clone());
        (reporter, sink, clock)
    }

    fn quiet(config: TxTimerConfig) -> TxTimerConfig {
        // Long tick so wakes from recording never reach a pass by themselves
        TxTimerConfig {
            reporter_tick_ms: 600_000,
            ..config
        }
    }

    fn record(reporter: &Reporter, clock: &ManualClock, group: &str, name: &str, elapsed: i64) {
        let series = reporter.registry().resolve(group, name);
        series.begin();
        series.complete(clock.now_millis(), elapsed);
    }

    #[test]
    fn test_single_window_line() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 1,
            ..Default::default()
        }));
        for i in 1..=10 {
            record(&reporter, &clock, "G", "X", i * 10);
        }
        clock.advance_minutes(1);
        let outcome = reporter.run_pass();
        reporter.shutdown();

        assert_eq!(outcome.lines, 1);
        assert_eq!(outcome.blocks, 1);
        let blocks = sink.blocks();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0][0].starts_with("Group (G) Time ("));
        assert!(blocks[0][0].ends_with("  Page 1"));
        assert_eq!(
            blocks[0][1],
            "X > last 1 min ( cnt:10, avg:55ms, max:100ms, min:10ms ) total ( cnt:10, ing:0, est-avg: 55ms )"
        );
    }

    #[test]
    fn test_window_excludes_current_minute() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "X", 10);
        // Same minute: the window ends at the start of this minute
        reporter.run_pass();
        reporter.shutdown();
        assert!(sink.lines()[1].contains("( cnt:0, avg:0ms, max:0ms, min:0ms )"));
        assert!(sink.lines()[1].contains("total ( cnt:1, ing:0,"));
    }

    #[test]
    fn test_stale_lap_is_ignored() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "X", 10);
        // One full ring (8 slots) later the slot lines up with the window again
        clock.advance_minutes(9);
        reporter.run_pass();
        reporter.shutdown();
        assert!(sink.lines()[1].contains("( cnt:0,"));
    }

    #[test]
    fn test_threshold_filters_quiet_transactions() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            threshold_avg_ms: Some(1_000),
            ..Default::default()
        }));
        for name in ["a", "b", "c"] {
            record(&reporter, &clock, "G", name, 50);
        }
        clock.advance_minutes(1);
        let outcome = reporter.run_pass();
        reporter.shutdown();
        assert_eq!(outcome.lines, 0);
        assert!(sink.blocks().is_empty());
    }

    #[test]
    fn test_threshold_keeps_slow_transactions() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            threshold_max_ms: Some(500),
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "fast", 20);
        record(&reporter, &clock, "G", "slow", 20);
        record(&reporter, &clock, "G", "slow", 800);
        clock.advance_minutes(1);
        reporter.run_pass();
        reporter.shutdown();

        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("slow > "));
    }

    #[test]
    fn test_pagination() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            page_lines: 2,
            ..Default::default()
        }));
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            record(&reporter, &clock, "G", name, (i as i64 + 1) * 10);
        }
        clock.advance_minutes(1);
        let outcome = reporter.run_pass();
        reporter.shutdown();

        let blocks = sink.blocks();
        assert_eq!(outcome.blocks, 3);
        assert_eq!(blocks.len(), 3);
        let sizes: Vec<usize> = blocks.iter().map(|b| b.len() - 1).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        for (i, block) in blocks.iter().enumerate() {
            assert!(block[0].ends_with(&format!("  Page {}", i + 1)));
        }
        // Sorted by average, slowest first
        assert!(blocks[0][1].starts_with("e > "));
        assert!(blocks[2][1].starts_with("a > "));
    }

    #[test]
    fn test_page_counter_resets_per_group() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            page_lines: 1,
            ..Default::default()
        }));
        record(&reporter, &clock, "A", "x", 1);
        record(&reporter, &clock, "A", "y", 2);
        record(&reporter, &clock, "B", "z", 3);
        clock.advance_minutes(1);
        reporter.run_pass();
        reporter.shutdown();

        let titles: Vec<String> = sink.blocks().iter().map(|b| b[0].clone()).collect();
        assert_eq!(titles.len(), 3);
        assert!(titles[0].starts_with("Group (A)") && titles[0].ends_with("Page 1"));
        assert!(titles[1].starts_with("Group (A)") && titles[1].ends_with("Page 2"));
        assert!(titles[2].starts_with("Group (B)") && titles[2].ends_with("Page 1"));
    }

    #[test]
    fn test_missing_stop_block_comes_first_and_persists() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            threshold_avg_ms: Some(10_000),
            ..Default::default()
        }));
        reporter.note_missing_stop();
        reporter.note_missing_stop();
        record(&reporter, &clock, "G", "X", 1);

        reporter.run_pass();
        reporter.run_pass();
        reporter.shutdown();

        let blocks = sink.blocks();
        assert_eq!(blocks.len(), 2);
        for block in blocks {
            assert_eq!(block.len(), 1);
            assert!(block[0].starts_with("ERROR!!! Times:2, "));
        }
    }

    #[test]
    fn test_duplicate_start_bypasses_threshold_once() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            threshold_avg_ms: Some(10_000),
            ..Default::default()
        }));
        let series = reporter.registry().resolve("G", "X");
        series.note_duplicate_start();
        record(&reporter, &clock, "G", "X", 1);

        let first = reporter.run_pass();
        let second = reporter.run_pass();
        reporter.shutdown();

        assert_eq!(first.lines, 1);
        assert_eq!(second.lines, 0);
        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("X > "));
        assert!(lines[2].starts_with("ERROR!!! Times:1, start() called again for G/X"));
    }

    #[test]
    fn test_report_all_cycle_ignores_thresholds() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            report_all_interval_minutes: Some(10),
            threshold_avg_ms: Some(10_000),
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "X", 1);
        clock.advance_minutes(1);
        assert!(!reporter.run_pass().full);
        assert!(sink.blocks().is_empty());

        clock.advance_minutes(10);
        let outcome = reporter.run_pass();
        reporter.shutdown();
        assert!(outcome.full);
        assert_eq!(outcome.lines, 1);
    }

    #[test]
    fn test_smoothing_weights() {
        assert_eq!(smooth_estimate(None, 55.0, 10, 10), 55.0);
        // Window holds every completion: weight 1
        assert_eq!(smooth_estimate(Some(10.0), 30.0, 5, 5), 30.0);
        // Half the completions: weight 0.5
        assert_eq!(smooth_estimate(Some(10.0), 30.0, 5, 10), 20.0);
        // Tiny share clamps to 0.03
        let e = smooth_estimate(Some(100.0), 0.0, 1, 1_000);
        assert!((e - 97.0).abs() < 1e-9);
        // Above 10,000 completions the weight is fixed
        let e = smooth_estimate(Some(100.0), 0.0, 20_000, 20_001);
        assert!((e - 97.0).abs() < 1e-9);
        assert_eq!(smooth_estimate(Some(10.0), 0.0, 0, 0), 0.0);
    }

    #[test]
    fn test_estimate_persists_across_passes() {
        let (reporter, _sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "X", 100);
        clock.advance_minutes(1);
        reporter.run_pass();
        let series = reporter.registry().resolve("G", "X");
        assert_eq!(series.smoothed_estimate(), Some(100.0));

        // Three more at 20ms: window avg (100 + 60) / 4 = 40, share 4/4
        for _ in 0..3 {
            record(&reporter, &clock, "G", "X", 20);
        }
        clock.advance_minutes(1);
        reporter.run_pass();
        reporter.shutdown();
        assert_eq!(series.smoothed_estimate(), Some(40.0));
    }

    #[test]
    fn test_snapshot_is_read_only() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "X", 30);
        reporter.registry().resolve("G", "X").note_duplicate_start();
        clock.advance_minutes(1);

        let groups = reporter.snapshot();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].lines[0].window_avg_ms, 30);
        assert_eq!(groups[0].lines[0].new_duplicate_starts, 1);

        let series = reporter.registry().resolve("G", "X");
        assert_eq!(series.smoothed_estimate(), None);
        assert_eq!(series.pending_duplicate_starts(), 1);
        assert!(sink.blocks().is_empty());
        reporter.shutdown();
    }

    #[test]
    fn test_worker_runs_one_pass_then_idles() {
        let (reporter, sink, clock) = setup(TxTimerConfig {
            report_interval_minutes: 1,
            reporter_tick_ms: 5,
            ..Default::default()
        });
        record(&reporter, &clock, "G", "X", 10);
        assert_ne!(reporter.state(), ReporterState::Idle);

        clock.advance_minutes(2);
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.blocks().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        while reporter.state() != ReporterState::Idle && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.blocks().len(), 1);
        assert_eq!(reporter.state(), ReporterState::Idle);
        reporter.shutdown();
    }

    #[test]
    fn test_shutdown_stops_sleeping_worker_promptly() {
        let (reporter, _sink, clock) = setup(TxTimerConfig {
            report_interval_minutes: 5,
            ..Default::default()
        });
        record(&reporter, &clock, "G", "X", 10);
        assert_eq!(reporter.state(), ReporterState::Scheduled);

        let started = Instant::now();
        reporter.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(reporter.state(), ReporterState::Idle);
        assert!(reporter.is_shutdown());

        reporter.wake();
        assert_eq!(reporter.state(), ReporterState::Idle);
    }

    #[test]
    fn test_overflowing_transaction_is_skipped_others_reported() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "huge", i64::MAX - 5);
        clock.advance_minutes(1);
        record(&reporter, &clock, "G", "huge", i64::MAX - 5);
        record(&reporter, &clock, "G", "ok", 7);
        clock.advance_minutes(1);

        let outcome = reporter.run_pass();
        reporter.shutdown();

        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.lines, 1);
        assert_eq!(outcome.blocks, 1);
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("ok > last 2 min ( cnt:1, avg:7ms,"));
        // The skipped series keeps no estimate from this pass
        let huge = reporter.registry().resolve("G", "huge");
        assert_eq!(huge.smoothed_estimate(), None);
    }

    #[test]
    fn test_saturated_bucket_is_skipped() {
        let (reporter, _sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            ..Default::default()
        }));
        record(&reporter, &clock, "G", "huge", i64::MAX - 5);
        record(&reporter, &clock, "G", "huge", i64::MAX - 5);
        clock.advance_minutes(1);

        let series = reporter.registry().resolve("G", "huge");
        let (start, end) = reporter.window(clock.now_millis());
        assert!(matches!(
            summarize_window(&series, start, end),
            Err(ReportError::Overflow { .. })
        ));
        assert_eq!(reporter.run_pass().skipped, 1);
        reporter.shutdown();
    }

    #[test]
    fn test_duplicate_start_line_does_not_count_toward_page() {
        let (reporter, sink, clock) = setup(quiet(TxTimerConfig {
            report_interval_minutes: 2,
            page_lines: 2,
            ..Default::default()
        }));
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            record(&reporter, &clock, "G", name, (i as i64 + 1) * 10);
        }
        // "e" is slowest, so it opens the first page
        reporter.registry().resolve("G", "e").note_duplicate_start();
        clock.advance_minutes(1);
        let outcome = reporter.run_pass();
        reporter.shutdown();

        assert_eq!(outcome.blocks, 3);
        let blocks = sink.blocks();
        let transactions: Vec<usize> = blocks
            .iter()
            .map(|b| b[1..].iter().filter(|l| !l.starts_with("ERROR!!!")).count())
            .collect();
        assert_eq!(transactions, vec![2, 2, 1]);
        assert_eq!(blocks[0].len(), 4);
        assert!(blocks[0][1].starts_with("e > "));
        assert!(blocks[0][2].starts_with("ERROR!!! Times:1, "));
        assert!(blocks[0][3].starts_with("d > "));
    }

    #[test]
    fn test_format_line_with_estimate_truncation() {
        let line = ReportLine {
            group: "G".into(),
            name: "X".into(),
            window_count: 3,
            window_avg_ms: 7,
            window_max_ms: 9,
            window_min_ms: 5,
            lifetime_finished: 12,
            lifetime_running: 2,
            lifetime_failures: 0,
            estimate_avg_ms: 6.9,
            new_duplicate_starts: 0,
            lifetime_duplicate_starts: 0,
        };
        assert_eq!(
            format_line(&line, 5),
            "X > last 5 min ( cnt:3, avg:7ms, max:9ms, min:5ms ) total ( cnt:12, ing:2, est-avg: 6ms )"
        );
    }

    #[test]
    fn test_anomaly_line_format() {
        assert_eq!(anomaly_line(3, "boom"), "ERROR!!! Times:3, boom");
    }
}
