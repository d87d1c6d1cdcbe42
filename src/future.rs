//! Completion handle for a pending action across all its target threads.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Per-future counters. `queued` tracks targets that have not yet begun the
/// action, `remaining` tracks targets that have neither finished it nor been
/// confirmed unreachable. Deactivating a thread (it left the context before
/// the action could run) decrements both; reactivating it restores both.
#[derive(Debug)]
struct FutureState {
    queued: usize,
    remaining: usize,
    cancelled: bool,
}

/// Tracks completion of one submitted action across all targeted threads.
///
/// The future resolves once every originally-targeted thread has executed
/// the action or been confirmed unreachable, or when it is cancelled during
/// a cancelling context close. Bookkeeping transitions are driven by the
/// safepoint-interruption capability; submitters only wait and observe.
///
/// # Examples
///
/// ```ignore
/// let future = context.submit(None, "tooling", action, false)?;
/// future.wait();
/// assert!(future.is_done());
/// ```
#[derive(Debug)]
pub struct HandshakeFuture {
    state: Mutex<FutureState>,
    done: Condvar,
}

impl HandshakeFuture {
    /// A future armed for `targets` threads, none of which have started.
    pub(crate) fn armed(targets: usize) -> Self {
        Self {
            state: Mutex::new(FutureState {
                queued: targets,
                remaining: targets,
                cancelled: false,
            }),
            done: Condvar::new(),
        }
    }

    /// An already-resolved future, returned when a submission has nothing to
    /// do (closed context or empty target set).
    pub(crate) fn completed() -> Self {
        Self::armed(0)
    }

    /// Whether all targets have finished or the future was cancelled.
    pub fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.cancelled || state.remaining == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Whether every target has begun executing or become unreachable. Used
    /// by sync-start submitters.
    pub(crate) fn all_started(&self) -> bool {
        let state = self.state.lock();
        state.cancelled || state.queued == 0
    }

    /// Best-effort cancellation: marks the future cancelled and wakes
    /// waiters. Already-queued deliveries are skipped when their worker
    /// dequeues them.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if !state.cancelled {
            state.cancelled = true;
            self.done.notify_all();
        }
    }

    /// Block until the future resolves.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !(state.cancelled || state.remaining == 0) {
            self.done.wait(&mut state);
        }
    }

    /// Block until the future resolves or `timeout` elapses. Returns whether
    /// the future is resolved.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.cancelled || state.remaining == 0 {
            return true;
        }
        self.done.wait_for(&mut state, timeout);
        state.cancelled || state.remaining == 0
    }

    /// A target thread dequeued the action and is about to run it.
    pub(crate) fn thread_started(&self) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
    }

    /// A target thread finished running the action. Returns whether this was
    /// the last outstanding target.
    pub(crate) fn thread_finished(&self) -> bool {
        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.done.notify_all();
            true
        } else {
            false
        }
    }

    /// A target thread became unreachable before running the action.
    /// Returns whether this was the last outstanding target.
    pub(crate) fn thread_deactivated(&self) -> bool {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.done.notify_all();
            true
        } else {
            false
        }
    }

    /// A previously-deactivated target became reachable again.
    pub(crate) fn thread_activated(&self) {
        let mut state = self.state.lock();
        state.queued += 1;
        state.remaining += 1;
    }
}
