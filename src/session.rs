//! Turning a start/stop pair into one recorded duration
//!
//! Two protocols:
//!
//! - **Explicit**: `enter` hands back a [`TxToken`] that carries everything
//!   `exit` needs. Tokens are `Send`, so a transaction may begin on one thread
//!   and end on another. [`TxGuard`] wraps a token and exits on drop.
//! - **Implicit**: `start`/`stop` keep the open session in thread-local
//!   storage, keyed by the owning timer so independent timers on the same
//!   thread never see each other's sessions.

use crate::clock::Clock;
use crate::series::TransactionSeries;
use fnv::FnvHashMap;
use std::cell::RefCell;
use std::sync::Arc;

/// An open explicit session
///
/// Produced by [`crate::TxTimer::enter`], consumed by [`crate::TxTimer::exit`].
#[derive(Debug)]
#[must_use = "an unfinished token leaves the transaction counted as running"]
pub struct TxToken {
    series: Option<Arc<TransactionSeries>>,
    start_millis: i64,
}

impl TxToken {
    pub(crate) fn new(series: Arc<TransactionSeries>, start_millis: i64) -> Self {
        Self {
            series: Some(series),
            start_millis,
        }
    }

    /// Token handed out by a disabled timer; exiting it does nothing
    pub(crate) fn inert() -> Self {
        Self {
            series: None,
            start_millis: 0,
        }
    }

    pub fn group(&self) -> Option<&str> {
        self.series.as_deref().map(TransactionSeries::group)
    }

    pub fn name(&self) -> Option<&str> {
        self.series.as_deref().map(TransactionSeries::name)
    }

    pub fn start_millis(&self) -> i64 {
        self.start_millis
    }

    pub fn is_inert(&self) -> bool {
        self.series.is_none()
    }

    /// Record the completion; a non-zero `result_code` also counts a failure
    pub(crate) fn finish(self, now_millis: i64, result_code: i32) {
        if let Some(series) = self.series {
            series.complete(now_millis, now_millis - self.start_millis);
            if result_code != 0 {
                series.note_failure();
            }
        }
    }
}

/// Explicit session that exits when dropped
#[must_use = "dropping the guard immediately ends the transaction"]
pub struct TxGuard {
    token: Option<TxToken>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TxGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxGuard").field("token", &self.token).finish()
    }
}

impl TxGuard {
    pub(crate) fn new(token: TxToken, clock: Arc<dyn Clock>) -> Self {
        Self {
            token: Some(token),
            clock,
        }
    }

    /// End the transaction now with an explicit result code
    pub fn finish(mut self, result_code: i32) {
        self.close(result_code);
    }

    fn close(&mut self, result_code: i32) {
        if let Some(token) = self.token.take() {
            token.finish(self.clock.now_millis(), result_code);
        }
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        self.close(0);
    }
}

/// A thread-bound session opened by `start`
#[derive(Debug)]
pub(crate) struct ImplicitSession {
    pub series: Arc<TransactionSeries>,
    pub start_millis: i64,
}

thread_local! {
    static OPEN_SESSIONS: RefCell<FnvHashMap<u64, ImplicitSession>> =
        RefCell::new(FnvHashMap::default());
}

/// Store `session` for `owner` on this thread, returning any session it replaced
pub(crate) fn open_implicit(owner: u64, session: ImplicitSession) -> Option<ImplicitSession> {
    OPEN_SESSIONS
        .try_with(|open| open.borrow_mut().insert(owner, session))
        .ok()
        .flatten()
}

/// Remove and return this thread's open session for `owner`
pub(crate) fn close_implicit(owner: u64) -> Option<ImplicitSession> {
    OPEN_SESSIONS
        .try_with(|open| open.borrow_mut().remove(&owner))
        .ok()
        .flatten()
}

/// Whether this thread holds an open session for `owner`
pub(crate) fn has_implicit(owner: u64) -> bool {
    OPEN_SESSIONS
        .try_with(|open| open.borrow().contains_key(&owner))
        .unwrap_or(false)
}
