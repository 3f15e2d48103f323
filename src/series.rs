//! Per-transaction statistics: a ring of minute buckets plus lifetime counters
//!
//! # Design
//!
//! ```text
//! minute index m = now / 60s
//!   slot  = m mod ring_length      which bucket
//!   epoch = m div ring_length      which lap of the ring
//!
//!  ring: [ b0 | b1 | b2 | ... | b(n-1) ]     n = interval + 6
//!           ^ hot path rotates and records into ring[slot]
//!  window [start, end) -> ring[start_slot..end_slot), wrapping if needed
//! ```
//!
//! The ring is allocated once. The hot path (`begin`, `complete`,
//! `bucket_for`) is atomics only and never allocates.

use crate::bucket::Bucket;
use crate::clock::MINUTE_MS;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Something to poke when a transaction starts or finishes
pub trait WakeSignal: Send + Sync {
    fn wake(&self);
}

/// A wake signal nobody listens to
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWake;

impl WakeSignal for NoWake {
    fn wake(&self) {}
}

/// Bit pattern of an unset smoothed estimate
const ESTIMATE_UNSET: u64 = u64::MAX;

/// Statistics for one (group, name) pair
pub struct TransactionSeries {
    group: String,
    name: String,
    ring: Box<[CachePadded<Bucket>]>,
    max_update_attempts: u32,
    waker: Arc<dyn WakeSignal>,

    lifetime_finished: CachePadded<AtomicU64>,
    lifetime_running: CachePadded<AtomicI64>,
    lifetime_duplicate_starts: AtomicU64,
    lifetime_failures: AtomicU64,

    // Reporter-owned state, never touched on the hot path
    reported_duplicate_starts: AtomicU64,
    smoothed_estimate: AtomicU64,
}

impl std::fmt::Debug for TransactionSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSeries")
            .field("group", &self.group)
            .field("name", &self.name)
            .field("ring_length", &self.ring.len())
            .field("lifetime_finished", &self.lifetime_finished())
            .field("lifetime_running", &self.lifetime_running())
            .finish()
    }
}

impl TransactionSeries {
    /// Create a series with a ring of `ring_length` buckets
    ///
    /// # Panics
    ///
    /// Panics if `ring_length` is 0.
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        ring_length: usize,
        max_update_attempts: u32,
        waker: Arc<dyn WakeSignal>,
    ) -> Self {
        assert!(ring_length > 0, "Ring length must be > 0");
        let ring = (0..ring_length)
            .map(|_| CachePadded::new(Bucket::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            group: group.into(),
            name: name.into(),
            ring,
            max_update_attempts,
            waker,
            lifetime_finished: CachePadded::new(AtomicU64::new(0)),
            lifetime_running: CachePadded::new(AtomicI64::new(0)),
            lifetime_duplicate_starts: AtomicU64::new(0),
            lifetime_failures: AtomicU64::new(0),
            reported_duplicate_starts: AtomicU64::new(0),
            smoothed_estimate: AtomicU64::new(ESTIMATE_UNSET),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring_length(&self) -> usize {
        self.ring.len()
    }

    /// Bucket for the minute containing `now_millis`, rotated onto the
    /// current lap if needed
    pub fn bucket_for(&self, now_millis: i64) -> &Bucket {
        let len = self.ring.len() as i64;
        let minute_index = now_millis.div_euclid(MINUTE_MS);
        let epoch = minute_index.div_euclid(len);
        let slot = minute_index.rem_euclid(len) as usize;

        let bucket = &self.ring[slot];
        bucket.try_rotate(minute_index * MINUTE_MS, epoch);
        bucket
    }

    /// Buckets covering `[start_millis, end_millis)` in chronological order
    ///
    /// Returns nothing when both ends fall on the same slot.
    pub fn buckets_in_window(&self, start_millis: i64, end_millis: i64) -> Vec<&Bucket> {
        let len = self.ring.len() as i64;
        let start_slot = start_millis.div_euclid(MINUTE_MS).rem_euclid(len) as usize;
        let end_slot = end_millis.div_euclid(MINUTE_MS).rem_euclid(len) as usize;

        if start_slot < end_slot {
            self.ring[start_slot..end_slot].iter().map(|b| &**b).collect()
        } else if start_slot > end_slot {
            self.ring[start_slot..]
                .iter()
                .chain(self.ring[..end_slot].iter())
                .map(|b| &**b)
                .collect()
        } else {
            Vec::new()
        }
    }

    /// A transaction instance started
    pub fn begin(&self) {
        self.lifetime_running.fetch_add(1, Ordering::AcqRel);
        self.waker.wake();
    }

    /// A transaction instance finished at `now_millis` after `elapsed_ms`
    pub fn complete(&self, now_millis: i64, elapsed_ms: i64) {
        self.lifetime_running.fetch_sub(1, Ordering::AcqRel);
        self.lifetime_finished.fetch_add(1, Ordering::AcqRel);
        self.bucket_for(now_millis)
            .record(elapsed_ms, self.max_update_attempts);
        self.waker.wake();
    }

    pub(crate) fn note_duplicate_start(&self) {
        self.lifetime_duplicate_starts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_failure(&self) {
        self.lifetime_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn lifetime_finished(&self) -> u64 {
        self.lifetime_finished.load(Ordering::Acquire)
    }

    pub fn lifetime_running(&self) -> i64 {
        self.lifetime_running.load(Ordering::Acquire)
    }

    pub fn lifetime_duplicate_starts(&self) -> u64 {
        self.lifetime_duplicate_starts.load(Ordering::Acquire)
    }

    /// Completions that exited with a non-zero result code
    pub fn lifetime_failures(&self) -> u64 {
        self.lifetime_failures.load(Ordering::Acquire)
    }

    /// Duplicate starts not yet claimed by a reporting pass
    pub fn pending_duplicate_starts(&self) -> u64 {
        self.lifetime_duplicate_starts()
            .saturating_sub(self.reported_duplicate_starts.load(Ordering::Acquire))
    }

    /// Duplicate starts recorded since the previous call
    pub(crate) fn take_new_duplicate_starts(&self) -> u64 {
        let current = self.lifetime_duplicate_starts();
        let previous = self
            .reported_duplicate_starts
            .swap(current, Ordering::AcqRel);
        current.saturating_sub(previous)
    }

    /// Long-lived average latency estimate (ms), `None` before the first pass
    pub fn smoothed_estimate(&self) -> Option<f64> {
        match self.smoothed_estimate.load(Ordering::Acquire) {
            ESTIMATE_UNSET => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    pub(crate) fn set_smoothed_estimate(&self, estimate: f64) {
        self.smoothed_estimate
            .store(estimate.to_bits(), Ordering::Release);
    }
}
