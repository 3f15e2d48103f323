//! One-minute accumulation slot guarded by a version number
//!
//! A [`Bucket`] is reused forever by a transaction's ring. Its `epoch` says
//! which lap of the ring currently owns the slot and works like a seqlock
//! sequence number:
//!
//! - writers claim a new lap with a single compare-and-swap of `epoch` to a
//!   negative "rotating" marker, reset the four accumulators, then publish
//!   the real epoch;
//! - anyone arriving through [`Bucket::try_rotate`] while the marker is set
//!   waits for the publish, so no record lands before the reset;
//! - recorders only ever touch the accumulators with atomic add / CAS;
//! - readers take `epoch`, read the accumulators, re-read `epoch`, and throw
//!   the whole snapshot away if the two differ or a rotation is in flight.
//!
//! No lock is ever taken. The price is that min/max updates are bounded
//! CAS loops that may give up under extreme contention; `count` is always
//! exact and `total_elapsed` is exact until it saturates at `i64::MAX`.
//!
//! Epochs are non-negative. A negative epoch (a minute before 1970) never
//! claims a slot.

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicI64, Ordering};

/// Reset value of `max_elapsed` ("minus infinity")
pub const MAX_SENTINEL: i64 = i64::MIN;
/// Reset value of `min_elapsed` ("plus infinity")
pub const MIN_SENTINEL: i64 = i64::MAX;

/// Epoch of a slot that no lap has claimed yet
const UNCLAIMED_EPOCH: i64 = -1;

/// Value `epoch` holds while the slot is being reset for lap `epoch`
fn rotating_marker(epoch: i64) -> i64 {
    -(epoch + 2)
}

fn is_rotating(raw_epoch: i64) -> bool {
    raw_epoch < UNCLAIMED_EPOCH
}

/// Time-sliced accumulator for one minute of one transaction
#[derive(Debug)]
pub struct Bucket {
    epoch: AtomicI64,
    slot_start: AtomicI64,
    count: AtomicI64,
    total_elapsed: AtomicI64,
    max_elapsed: AtomicI64,
    min_elapsed: AtomicI64,
}

/// Values read from a bucket, bracketed by two reads of its epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub epoch_before: i64,
    pub slot_start: i64,
    pub count: i64,
    pub total_elapsed: i64,
    pub max_elapsed: i64,
    pub min_elapsed: i64,
    pub epoch_after: i64,
}

impl BucketSnapshot {
    /// `false` when the bucket rotated while it was being read
    pub fn is_consistent(&self) -> bool {
        self.epoch_before == self.epoch_after && !is_rotating(self.epoch_before)
    }

    /// `true` when `total_elapsed` hit the edge of `i64` and stopped moving
    pub fn is_saturated(&self) -> bool {
        self.total_elapsed == i64::MAX || self.total_elapsed == i64::MIN
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            epoch: AtomicI64::new(UNCLAIMED_EPOCH),
            slot_start: AtomicI64::new(0),
            count: AtomicI64::new(0),
            total_elapsed: AtomicI64::new(0),
            max_elapsed: AtomicI64::new(MAX_SENTINEL),
            min_elapsed: AtomicI64::new(MIN_SENTINEL),
        }
    }

    /// Current lap owning this slot, or a negative marker mid-rotation
    pub fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Claim the slot for `epoch` and reset it to represent `slot_start`
    ///
    /// Returns `false` without touching anything when the slot already
    /// belongs to `epoch` or a later lap. At most one caller succeeds per
    /// epoch value. While another caller is resetting the slot this waits,
    /// so on return the slot is never mid-reset.
    pub fn try_rotate(&self, slot_start: i64, epoch: i64) -> bool {
        let backoff = Backoff::new();
        let mut current = self.epoch.load(Ordering::Acquire);
        loop {
            if is_rotating(current) {
                backoff.snooze();
                current = self.epoch.load(Ordering::Acquire);
                continue;
            }
            if epoch <= current {
                return false;
            }
            match self.epoch.compare_exchange(
                current,
                rotating_marker(epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.slot_start.store(slot_start, Ordering::Release);
                    self.count.store(0, Ordering::Release);
                    self.total_elapsed.store(0, Ordering::Release);
                    self.max_elapsed.store(MAX_SENTINEL, Ordering::Release);
                    self.min_elapsed.store(MIN_SENTINEL, Ordering::Release);
                    self.epoch.store(epoch, Ordering::Release);
                    return true;
                }
                Err(observed) => {
                    current = observed;
                    backoff.spin();
                }
            }
        }
    }

    /// Add one completion of `elapsed_ms`
    ///
    /// Returns `false` if a min or max update ran out of `max_attempts`
    /// and was dropped. Count and total are always applied; the total
    /// saturates instead of wrapping.
    pub fn record(&self, elapsed_ms: i64, max_attempts: u32) -> bool {
        self.count.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .total_elapsed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                Some(total.saturating_add(elapsed_ms))
            });

        let max_ok = update_extremum(&self.max_elapsed, elapsed_ms, max_attempts, |new, cur| {
            new > cur
        });
        let min_ok = update_extremum(&self.min_elapsed, elapsed_ms, max_attempts, |new, cur| {
            new < cur
        });
        max_ok && min_ok
    }

    /// Read every field between two reads of the epoch
    pub fn snapshot(&self) -> BucketSnapshot {
        let epoch_before = self.epoch.load(Ordering::Acquire);
        let slot_start = self.slot_start.load(Ordering::Acquire);
        let count = self.count.load(Ordering::Acquire);
        let total_elapsed = self.total_elapsed.load(Ordering::Acquire);
        let max_elapsed = self.max_elapsed.load(Ordering::Acquire);
        let min_elapsed = self.min_elapsed.load(Ordering::Acquire);
        let epoch_after = self.epoch.load(Ordering::Acquire);
        BucketSnapshot {
            epoch_before,
            slot_start,
            count,
            total_elapsed,
            max_elapsed,
            min_elapsed,
            epoch_after,
        }
    }
}

fn update_extremum(
    slot: &AtomicI64,
    value: i64,
    max_attempts: u32,
    improves: impl Fn(i64, i64) -> bool,
) -> bool {
    let mut current = slot.load(Ordering::Acquire);
    for _ in 0..max_attempts {
        if !improves(value, current) {
            return true;
        }
        match slot.compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
    !improves(value, current)
}
