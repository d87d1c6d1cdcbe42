//! Submission and lifecycle coordination for thread-local actions.
//!
//! This is the registry side of the protocol: [`Context::submit`] computes
//! target threads and registers the handshake, the activation notifications
//! propagate enter/leave transitions into arm/disarm effects, and
//! [`Context::notify_last_done`] retires handshakes once every target has
//! reported. All bookkeeping happens under the context lock; waiting and
//! completion notification happen strictly after it is released.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::access::Location;
use crate::action::ThreadLocalAction;
use crate::context::{Context, ContextInner};
use crate::diagnostics;
use crate::error::{ActionError, ActionResult};
use crate::future::HandshakeFuture;
use crate::handshake::{Handshake, TargetKind};

/// Which completion milestone a synchronous submitter waits for.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Started,
    Finished,
}

impl Context {
    /// Submit an action for execution on the targeted threads.
    ///
    /// `threads` of `None` targets all currently active threads; an explicit
    /// set is intersected with them. Membership is computed once, here:
    /// threads joining the context later never receive the action. The
    /// synchronous flag of the action decides whether this call blocks until
    /// every target has executed it or become unreachable.
    ///
    /// Returns the completion future, already resolved when the context is
    /// closed or no targeted thread is active.
    pub fn submit(
        self: &Arc<Self>,
        threads: Option<&[ThreadId]>,
        origin: &str,
        action: Arc<dyn ThreadLocalAction>,
        needs_enter: bool,
    ) -> ActionResult<Arc<HandshakeFuture>> {
        let sync = action.synchronous();
        self.submit_with(threads, origin, action, needs_enter, sync, sync, false)
    }

    /// Full-control submission with explicit synchronization flags.
    ///
    /// `sync_start` blocks the submitter until every target began the action
    /// (or became unreachable); `sync_end` until every target finished.
    /// `ignore_closed` lets internal actions submit against a closing
    /// context.
    pub fn submit_with(
        self: &Arc<Self>,
        threads: Option<&[ThreadId]>,
        origin: &str,
        action: Arc<dyn ThreadLocalAction>,
        needs_enter: bool,
        sync_start: bool,
        sync_end: bool,
        ignore_closed: bool,
    ) -> ActionResult<Arc<HandshakeFuture>> {
        let synchronous = action.synchronous();
        let side_effecting = action.side_effecting();
        debug_assert!(
            !synchronous || sync_start || sync_end,
            "no synchronization requested for a synchronous action"
        );
        debug_assert!(
            synchronous || (!sync_start && !sync_end),
            "synchronization requested for an asynchronous action"
        );

        let current = thread::current().id();
        let future = {
            let mut inner = self.inner.lock();

            if inner.state.is_closed() && !ignore_closed {
                return Ok(Arc::new(HandshakeFuture::completed()));
            }

            let filter: Option<HashSet<ThreadId>> =
                threads.map(|list| list.iter().copied().collect());

            let mut active_threads = Vec::new();
            for info in inner.threads.values() {
                if !info.is_active() {
                    continue;
                }
                if let Some(filter) = &filter {
                    if !filter.contains(&info.thread) {
                        continue;
                    }
                }
                if synchronous && info.thread == current && info.safepoint_active {
                    // A synchronous action waiting on the thread that is
                    // already inside a synchronous safepoint would deadlock.
                    return Err(ActionError::RecursiveSyncAction);
                }
                active_threads.push(info.thread);
            }

            let target_kind = match threads {
                None => TargetKind::AllThreads,
                Some(list) if list.len() == 1 => TargetKind::SingleThread,
                Some(list) => TargetKind::MultipleThreads(list.len()),
            };
            let debug_id = inner.id_counter;
            inner.id_counter += 1;

            let handshake = Arc::new(Handshake::new(
                debug_id,
                origin,
                action,
                needs_enter,
                target_kind,
                active_threads.iter().copied().collect(),
                Arc::downgrade(self),
            ));

            self.trace_submit(&handshake);

            if active_threads.is_empty() {
                Arc::new(HandshakeFuture::completed())
            } else {
                let future = self.interrupts.arm(
                    &active_threads,
                    Arc::clone(&handshake),
                    side_effecting,
                    sync_start,
                    sync_end,
                );
                inner.active.push(handshake);
                future
            }
        };

        // Synchronous waiting happens without the context lock so target
        // threads can take it from their action bodies.
        let mut poll_error = None;
        if sync_start {
            if let Err(err) = self.wait_sync(&future, SyncPhase::Started) {
                poll_error.get_or_insert(err);
            }
        }
        if sync_end {
            if let Err(err) = self.wait_sync(&future, SyncPhase::Finished) {
                poll_error.get_or_insert(err);
            }
        }
        match poll_error {
            Some(err) => Err(err),
            None => Ok(future),
        }
    }

    /// Wait for a completion milestone, draining the submitter's own queue
    /// while doing so. A submitter that is itself a target must keep
    /// processing deliveries or it would wait on itself forever. Errors from
    /// drained actions (which may predate this submission entirely) are
    /// stashed and re-raised only once the milestone is reached, so the wait
    /// is never abandoned with the future still pending.
    fn wait_sync(&self, future: &Arc<HandshakeFuture>, phase: SyncPhase) -> ActionResult<()> {
        let thread = thread::current().id();
        let location = Location::new("synchronous-submit-wait");
        let mut first_error = None;
        loop {
            let reached = match phase {
                SyncPhase::Started => future.all_started(),
                SyncPhase::Finished => future.is_done(),
            };
            if reached {
                return match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            if let Err(err) = self.interrupts.poll(thread, &location) {
                first_error.get_or_insert(err);
            }
            future.wait_timeout(Duration::from_millis(1));
        }
    }

    /// Propagate a thread's active-state transition to every pending
    /// handshake that targets it. Called with the context lock held on the
    /// enter-count 0→1 and 1→0 edges.
    ///
    /// Futures resolved by disarming are pushed into `resolved`; the caller
    /// completion-notifies them once the lock is released. Returns the
    /// actions whose delivery state actually changed.
    pub(crate) fn notify_thread_activation(
        &self,
        inner: &mut ContextInner,
        thread: ThreadId,
        active: bool,
        resolved: &mut Vec<Arc<Handshake>>,
    ) -> Vec<Arc<dyn ThreadLocalAction>> {
        debug_assert!(
            !active
                || inner
                    .threads
                    .get(&thread)
                    .is_some_and(|info| info.entered_count == 1),
            "must be currently entered successfully"
        );

        if inner.active.is_empty() {
            // Fast common path: enter/leave stays cheap with no actions
            // pending.
            return Vec::new();
        }

        let mut changed = Vec::new();
        let snapshot = inner.active.clone();
        for handshake in snapshot {
            if !handshake.is_enabled_for(thread) {
                continue;
            }
            if active {
                if self.interrupts.activate(thread, &handshake) {
                    changed.push(Arc::clone(handshake.action()));
                }
            } else if self.interrupts.deactivate(thread, &handshake) {
                changed.push(Arc::clone(handshake.action()));
                if handshake.future().is_some_and(|future| future.is_done()) {
                    resolved.push(handshake);
                }
            }
        }
        changed
    }

    /// Close-time flush of the active set. Called with the context lock held
    /// after the state transition.
    pub(crate) fn notify_context_closed(&self, inner: &mut ContextInner) {
        if !inner.active.is_empty() {
            let snapshot = inner.active.clone();
            let mut pending_cancelled = false;
            for handshake in &snapshot {
                let unresolved = handshake
                    .future()
                    .is_some_and(|future| !future.is_done());
                if !unresolved {
                    continue;
                }
                if inner.state.is_cancelled() {
                    if let Some(future) = handshake.future() {
                        future.cancel();
                    }
                    pending_cancelled = true;
                } else {
                    // Leaving the context before close runs or disarms every
                    // pending action; an unresolved one here is a bug.
                    panic!(
                        "pending thread-local actions found at close; did the actions \
                         not process on last leave? pending {}",
                        handshake.trace_description()
                    );
                }
            }
            if !pending_cancelled {
                inner.active.clear();
            }
            // Cancelled entries stay registered so threads leaving after the
            // close still deactivate against them.
        }

        if let Some(statistics) = inner.statistics.take() {
            diagnostics::log_statistics(&statistics);
        }
    }

    /// Retire a handshake once its last target reported. Completion signals
    /// can race, so removal is an identity compare-and-remove and duplicate
    /// calls are no-ops. A signal can also race with a re-activation that
    /// restored the counters; counter restores happen under the context
    /// lock, so the future's state is settled once the lock is held, and
    /// the genuine last completion notifies again.
    pub(crate) fn notify_last_done(&self, handshake: &Arc<Handshake>) {
        let removed = {
            let mut inner = self.inner.lock();
            if handshake.future().is_some_and(|future| !future.is_done()) {
                return;
            }
            let before = inner.active.len();
            inner.active.retain(|entry| !Arc::ptr_eq(entry, handshake));
            inner.active.len() != before
        };
        if removed {
            let cancelled = handshake
                .future()
                .is_some_and(|future| future.is_cancelled());
            self.trace(if cancelled { "cancelled" } else { "done" }, handshake, "");
        }
    }

    fn trace_submit(&self, handshake: &Handshake) {
        if !self.config().trace_actions {
            return;
        }
        let thread_label = match handshake.target_kind() {
            TargetKind::AllThreads => "all-threads".to_owned(),
            TargetKind::SingleThread => "single-thread".to_owned(),
            TargetKind::MultipleThreads(count) => format!("multiple-threads-{count}"),
        };
        let thread_label = format!("{thread_label}[alive={}]", handshake.target_count());
        let side_label = if handshake.side_effecting() {
            "side-effecting"
        } else {
            "side-effect-free"
        };
        let sync_label = if handshake.synchronous() {
            "synchronous"
        } else {
            "asynchronous"
        };
        self.trace(
            "submit",
            handshake,
            &format!("{thread_label:<25}  {side_label}  {sync_label}"),
        );
    }

    /// One structured trace line per protocol step, when tracing is enabled.
    pub(crate) fn trace(&self, phase: &str, handshake: &Handshake, details: &str) {
        if !self.config().trace_actions {
            return;
        }
        let current = thread::current();
        log::info!(
            target: "parley",
            "[tl] {:<18} {:>8}  {:<30} {:<10} {:<30} {}",
            phase,
            handshake.debug_id(),
            format!("thread[{}]", current.name().unwrap_or("unnamed")),
            handshake.origin(),
            handshake.trace_description(),
            details
        );
    }
}
