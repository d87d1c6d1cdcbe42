//! The pending-action (handshake) model and its execution wrapper.
//!
//! A [`Handshake`] represents one submitted action bound to the set of
//! threads that were active at submission time. The coordinator keeps it in
//! the context's active set until every target has executed the action or
//! been confirmed unreachable; the interrupt capability tracks per-thread
//! delivery through it. The execution wrapper in [`Handshake::perform`] is
//! the code that actually runs on an interrupted thread.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::access::{Location, SafepointAccess};
use crate::action::ThreadLocalAction;
use crate::context::Context;
use crate::error::{ActionError, ActionResult};
use crate::future::HandshakeFuture;

/// Per-thread delivery state, owned by the interrupt capability.
///
/// `Queued` means the action sits in the thread's safepoint queue; `Done`
/// means the thread dequeued it (and ran or skipped it). A deactivated
/// thread has no entry at all, which is what allows re-arming on re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    Done,
}

/// How the target set was described at submission, for trace output.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TargetKind {
    AllThreads,
    SingleThread,
    MultipleThreads(usize),
}

/// One submitted action bound to a frozen set of target threads.
pub struct Handshake {
    debug_id: u64,
    origin: String,
    action: Arc<dyn ThreadLocalAction>,
    needs_enter: bool,
    synchronous: bool,
    side_effecting: bool,
    target_kind: TargetKind,
    /// Computed once at submission against the live thread set. Threads that
    /// join the context later are never added.
    targets: HashSet<ThreadId>,
    delivery: DashMap<ThreadId, Delivery>,
    context: Weak<Context>,
    future: OnceLock<Arc<HandshakeFuture>>,
}

impl Handshake {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        debug_id: u64,
        origin: &str,
        action: Arc<dyn ThreadLocalAction>,
        needs_enter: bool,
        target_kind: TargetKind,
        targets: HashSet<ThreadId>,
        context: Weak<Context>,
    ) -> Self {
        let synchronous = action.synchronous();
        let side_effecting = action.side_effecting();
        Self {
            debug_id,
            origin: origin.to_owned(),
            action,
            needs_enter,
            synchronous,
            side_effecting,
            target_kind,
            targets,
            delivery: DashMap::new(),
            context,
            future: OnceLock::new(),
        }
    }

    pub(crate) fn debug_id(&self) -> u64 {
        self.debug_id
    }

    pub(crate) fn origin(&self) -> &str {
        &self.origin
    }

    pub(crate) fn action(&self) -> &Arc<dyn ThreadLocalAction> {
        &self.action
    }

    pub(crate) fn synchronous(&self) -> bool {
        self.synchronous
    }

    pub(crate) fn side_effecting(&self) -> bool {
        self.side_effecting
    }

    pub(crate) fn target_kind(&self) -> TargetKind {
        self.target_kind
    }

    pub(crate) fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Whether `thread` belongs to the frozen target set.
    pub(crate) fn is_enabled_for(&self, thread: ThreadId) -> bool {
        self.targets.contains(&thread)
    }

    pub(crate) fn context(&self) -> Option<Arc<Context>> {
        self.context.upgrade()
    }

    /// Set exactly once by the interrupt capability before any delivery is
    /// enqueued, so workers always observe it.
    pub(crate) fn set_future(&self, future: Arc<HandshakeFuture>) {
        let _ = self.future.set(future);
    }

    pub(crate) fn future(&self) -> Option<&Arc<HandshakeFuture>> {
        self.future.get()
    }

    pub(crate) fn delivery_state(&self, thread: ThreadId) -> Option<Delivery> {
        self.delivery.get(&thread).map(|entry| *entry.value())
    }

    pub(crate) fn delivery_queued(&self, thread: ThreadId) {
        self.delivery.insert(thread, Delivery::Queued);
    }

    pub(crate) fn delivery_done(&self, thread: ThreadId) {
        self.delivery.insert(thread, Delivery::Done);
    }

    pub(crate) fn delivery_cleared(&self, thread: ThreadId) {
        self.delivery.remove(&thread);
    }

    /// Execution wrapper run on the interrupted thread at its safepoint.
    ///
    /// Associates the thread with the context first when the handshake needs
    /// it (the guard dissociates on every exit path), constructs a
    /// [`SafepointAccess`] that is invalidated as soon as the body returns,
    /// and classifies errors: a guest error escaping a non-side-effecting
    /// action is a fatal internal violation, everything else is traced and
    /// re-raised to the poll caller. For synchronous actions the thread's
    /// safepoint-active flag is held for the duration of the body so that
    /// recursive synchronous submissions can be rejected.
    pub(crate) fn perform(&self, location: &Location) -> ActionResult<()> {
        let Some(context) = self.context.upgrade() else {
            // Context dropped out from under a late delivery; nothing to do.
            return Ok(());
        };

        let _enter = if self.needs_enter {
            Some(context.enter_if_needed()?)
        } else {
            None
        };

        let thread = thread::current().id();
        context.trace("  perform-start", self, "");

        let _sync = self
            .synchronous
            .then(|| SafepointActiveGuard::set(&context, thread));

        let access = SafepointAccess::new(thread, location.clone());
        let result = self.action.perform(&access);
        access.invalidate();

        match result {
            Ok(()) => {
                context.trace("  perform-done", self, "");
                Ok(())
            }
            Err(err) => {
                context.trace("  perform-failed", self, &format!(" exception: {err}"));
                if !self.side_effecting && err.is_guest() {
                    // Non-side-effecting actions are assumed incapable of
                    // triggering guest semantics.
                    panic!(
                        "guest error escaped a non-side-effecting thread-local action: {err}"
                    );
                }
                Err(err)
            }
        }
    }

    pub(crate) fn trace_description(&self) -> String {
        format!("action[{}]", self.action.label())
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("debug_id", &self.debug_id)
            .field("origin", &self.origin)
            .field("synchronous", &self.synchronous)
            .field("side_effecting", &self.side_effecting)
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Holds a thread's safepoint-active flag true for the duration of a
/// synchronous action body, resetting it on every exit path.
struct SafepointActiveGuard<'a> {
    context: &'a Arc<Context>,
    thread: ThreadId,
}

impl<'a> SafepointActiveGuard<'a> {
    fn set(context: &'a Arc<Context>, thread: ThreadId) -> Self {
        context.set_safepoint_active(thread, true);
        Self { context, thread }
    }
}

impl Drop for SafepointActiveGuard<'_> {
    fn drop(&mut self) {
        self.context.set_safepoint_active(self.thread, false);
    }
}
