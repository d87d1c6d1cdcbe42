//! Shared execution context and per-thread bookkeeping.
//!
//! A [`Context`] owns the set of worker threads cooperating through
//! safepoints and the single lock guarding all coordination state: the
//! thread registry, the active handshake set, and the per-thread flags. The
//! lock covers bookkeeping only; it is never held while an action body
//! executes, since bodies may take it themselves.
//!
//! Workers associate with a context through [`Context::enter`], poll
//! [`Context::poll_safepoint`] from their hot loops, and dissociate by
//! dropping the returned guard. Entering for the first time starts the
//! thread's statistics stream when enabled; the enter/leave transitions arm
//! and disarm pending handshakes for the thread.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::access::Location;
use crate::config::ActionsConfig;
use crate::diagnostics::{self, SamplerHandle, StatisticsAction};
use crate::error::{ActionError, ActionResult};
use crate::handshake::Handshake;
use crate::interrupt::{CooperativeInterrupts, SafepointInterrupts};

/// Context lifecycle states. Created open, closed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Closed,
    /// A cancelling shutdown: in-flight actions are force-cancelled instead
    /// of drained.
    ClosedCancelled,
}

impl ContextState {
    pub fn is_closed(self) -> bool {
        !matches!(self, ContextState::Open)
    }

    pub(crate) fn is_cancelled(self) -> bool {
        matches!(self, ContextState::ClosedCancelled)
    }
}

/// Per-worker record tracked under the context lock.
#[derive(Debug)]
pub(crate) struct ThreadInfo {
    pub(crate) thread: ThreadId,
    /// Nested enter count; the thread is "active" while this is non-zero.
    pub(crate) entered_count: usize,
    /// Set while a synchronous action body runs on this thread, to reject
    /// recursive synchronous submissions.
    pub(crate) safepoint_active: bool,
}

impl ThreadInfo {
    fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            entered_count: 0,
            safepoint_active: false,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.entered_count > 0
    }
}

/// All mutable coordination state, guarded by the one context lock.
pub(crate) struct ContextInner {
    pub(crate) state: ContextState,
    /// Every thread that ever entered, kept after leaving so re-entries are
    /// distinguished from first enters.
    pub(crate) threads: HashMap<ThreadId, ThreadInfo>,
    /// Currently active handshakes, in submission order.
    pub(crate) active: Vec<Arc<Handshake>>,
    pub(crate) id_counter: u64,
    /// One collector per seen thread while statistics are enabled.
    pub(crate) statistics: Option<Vec<Arc<StatisticsAction>>>,
}

/// The shared execution environment coordinating thread-local actions.
///
/// # Examples
///
/// ```
/// use parley::{ActionsConfig, CallbackAction, Context, Location};
/// use std::sync::Arc;
///
/// let context = Context::new(ActionsConfig::default());
/// let guard = context.enter().unwrap();
///
/// let future = context
///     .submit(None, "example", Arc::new(CallbackAction::new(false, false, |_| Ok(()))), false)
///     .unwrap();
/// context.poll_safepoint(&Location::new("example-loop")).unwrap();
/// assert!(future.is_done());
///
/// drop(guard);
/// context.close(false);
/// ```
pub struct Context {
    pub(crate) inner: Mutex<ContextInner>,
    pub(crate) config: ArcSwap<ActionsConfig>,
    pub(crate) interrupts: Arc<dyn SafepointInterrupts>,
    sampler: Mutex<Option<SamplerHandle>>,
}

impl Context {
    /// Create a context using the in-process cooperative interrupt queues.
    pub fn new(config: ActionsConfig) -> Arc<Self> {
        Self::with_interrupts(config, Arc::new(CooperativeInterrupts::new()))
    }

    /// Create a context with a caller-provided interruption capability.
    pub fn with_interrupts(
        config: ActionsConfig,
        interrupts: Arc<dyn SafepointInterrupts>,
    ) -> Arc<Self> {
        let context = Arc::new(Self {
            inner: Mutex::new(ContextInner {
                state: ContextState::Open,
                threads: HashMap::new(),
                active: Vec::new(),
                id_counter: 0,
                statistics: None,
            }),
            config: ArcSwap::from_pointee(config),
            interrupts,
            sampler: Mutex::new(None),
        });
        context.initialize();
        context
    }

    pub(crate) fn config(&self) -> Arc<ActionsConfig> {
        self.config.load_full()
    }

    /// Apply the current configuration: reset the statistics list and
    /// (re)start or stop the sampler timer.
    fn initialize(self: &Arc<Self>) {
        let config = self.config();
        {
            let mut inner = self.inner.lock();
            inner.statistics = config.safepoint_statistics.then(Vec::new);
        }
        let mut sampler = self.sampler.lock();
        if let Some(handle) = sampler.take() {
            handle.cancel();
        }
        *sampler = config
            .stack_sample_interval
            .map(|interval| diagnostics::start_sampler(self, interval));
    }

    /// Cancel the sampler timer ahead of persisting or suspending the
    /// context. [`Context::on_patch`] recreates it on restore.
    pub fn prepare_store(&self) {
        if let Some(handle) = self.sampler.lock().take() {
            handle.cancel();
        }
    }

    /// Re-initialize after a restore with a possibly different
    /// configuration.
    pub fn on_patch(self: &Arc<Self>, config: ActionsConfig) {
        self.config.store(Arc::new(config));
        self.initialize();
    }

    /// Associate the calling thread with this context.
    ///
    /// Enters nest; the thread becomes active on the first enter and stays
    /// active until the matching number of guards have dropped. The first
    /// enter ever for a thread installs its statistics collector when
    /// statistics are enabled.
    pub fn enter(self: &Arc<Self>) -> ActionResult<ContextGuard> {
        let thread = thread::current().id();
        let newly_seen;
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return Err(ActionError::ContextClosed);
            }
            newly_seen = !inner.threads.contains_key(&thread);
            let info = inner
                .threads
                .entry(thread)
                .or_insert_with(|| ThreadInfo::new(thread));
            info.entered_count += 1;
            let became_active = info.entered_count == 1;
            if became_active {
                let mut resolved = Vec::new();
                self.notify_thread_activation(&mut inner, thread, true, &mut resolved);
                debug_assert!(resolved.is_empty(), "activation cannot resolve futures");
            }
        }

        if newly_seen && self.config().safepoint_statistics {
            diagnostics::install_statistics_for_current_thread(self);
        }

        Ok(ContextGuard {
            context: Arc::clone(self),
            thread,
            _not_send: PhantomData,
        })
    }

    /// Enter only if the calling thread is not already associated. Used by
    /// the execution wrapper for actions submitted with `needs_enter`.
    pub fn enter_if_needed(self: &Arc<Self>) -> ActionResult<Option<ContextGuard>> {
        let thread = thread::current().id();
        {
            let inner = self.inner.lock();
            if let Some(info) = inner.threads.get(&thread) {
                if info.is_active() {
                    return Ok(None);
                }
            }
        }
        self.enter().map(Some)
    }

    fn leave(self: &Arc<Self>, thread: ThreadId) {
        let mut resolved = Vec::new();
        {
            let mut inner = self.inner.lock();
            let Some(info) = inner.threads.get_mut(&thread) else {
                debug_assert!(false, "leave without matching enter");
                return;
            };
            debug_assert!(info.entered_count > 0, "leave without matching enter");
            info.entered_count -= 1;
            if info.entered_count == 0 {
                // Still-pending deliveries for this thread are disarmed; the
                // thread counts as unreachable for their futures.
                self.notify_thread_activation(&mut inner, thread, false, &mut resolved);
            }
        }
        // Completion notifications re-take the context lock, so they run
        // after it is released.
        for handshake in resolved {
            self.notify_last_done(&handshake);
        }
    }

    /// Run all actions currently pending for the calling thread, in
    /// submission order. Returns how many ran; the first action error is
    /// re-raised after bookkeeping completes for every delivery.
    pub fn poll_safepoint(&self, location: &Location) -> ActionResult<usize> {
        self.interrupts.poll(thread::current().id(), location)
    }

    /// Whether any submitted action is still tracked as pending.
    pub fn has_active_events(&self) -> bool {
        !self.inner.lock().active.is_empty()
    }

    pub(crate) fn set_safepoint_active(&self, thread: ThreadId, value: bool) {
        let mut inner = self.inner.lock();
        if let Some(info) = inner.threads.get_mut(&thread) {
            info.safepoint_active = value;
        }
    }

    /// Close the context.
    ///
    /// A normal close requires every pending action to have drained; finding
    /// one unresolved is a fatal consistency violation. A cancelling close
    /// force-cancels in-flight futures and keeps the active set so threads
    /// leaving afterwards still deactivate correctly.
    pub fn close(&self, cancelling: bool) {
        self.prepare_store();
        let mut inner = self.inner.lock();
        if inner.state.is_closed() {
            return;
        }
        debug_assert!(
            cancelling || inner.threads.values().all(|info| !info.is_active()),
            "context is still active, cannot flush safepoints"
        );
        inner.state = if cancelling {
            ContextState::ClosedCancelled
        } else {
            ContextState::Closed
        };
        self.notify_context_closed(&mut inner);
    }
}

/// RAII association of the current thread with a context. Dropping it leaves
/// the context; the last leave disarms still-pending actions for the thread.
///
/// Poll before dropping the guard when pending actions should run on this
/// thread rather than count it unreachable.
pub struct ContextGuard {
    context: Arc<Context>,
    thread: ThreadId,
    // Leaving must happen on the entering thread.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.context.leave(self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_nests_and_leaves() {
        let context = Context::new(ActionsConfig::default());
        let outer = context.enter().unwrap();
        let inner = context.enter().unwrap();

        {
            let state = context.inner.lock();
            let info = state.threads.get(&thread::current().id()).unwrap();
            assert_eq!(info.entered_count, 2);
        }

        drop(inner);
        drop(outer);

        let state = context.inner.lock();
        let info = state.threads.get(&thread::current().id()).unwrap();
        assert_eq!(info.entered_count, 0);
        // The thread stays in the seen set after leaving.
        assert!(!info.is_active());
    }

    #[test]
    fn enter_if_needed_is_noop_while_entered() {
        let context = Context::new(ActionsConfig::default());
        let _guard = context.enter().unwrap();
        assert!(context.enter_if_needed().unwrap().is_none());
    }

    #[test]
    fn enter_if_needed_enters_when_not_associated() {
        let context = Context::new(ActionsConfig::default());
        let guard = context.enter_if_needed().unwrap();
        assert!(guard.is_some());
        drop(guard);

        let state = context.inner.lock();
        let info = state.threads.get(&thread::current().id()).unwrap();
        assert!(!info.is_active());
    }

    #[test]
    fn enter_after_close_fails() {
        let context = Context::new(ActionsConfig::default());
        context.close(false);
        assert!(matches!(context.enter(), Err(ActionError::ContextClosed)));
    }

    #[test]
    fn close_is_idempotent() {
        let context = Context::new(ActionsConfig::default());
        context.close(false);
        context.close(false);
        assert!(context.inner.lock().state.is_closed());
    }

    #[test]
    #[should_panic(expected = "still active")]
    fn normal_close_with_active_thread_is_fatal() {
        let context = Context::new(ActionsConfig::default());
        let _guard = context.enter().unwrap();
        context.close(false);
    }

    #[test]
    fn cancelling_close_tolerates_active_threads() {
        let context = Context::new(ActionsConfig::default());
        let guard = context.enter().unwrap();
        context.close(true);
        assert!(context.inner.lock().state.is_cancelled());
        drop(guard);
    }
}
