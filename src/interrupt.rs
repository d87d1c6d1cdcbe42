//! Safepoint-interruption capability.
//!
//! The coordinator treats cross-thread delivery as an external primitive:
//! something that can arm a callback on a set of threads, later activate or
//! deactivate individual threads, and guarantee eventual exactly-once
//! delivery to every armed, active thread. [`SafepointInterrupts`] is that
//! seam; [`CooperativeInterrupts`] is the in-process implementation, modelled
//! as one FIFO queue per worker thread drained when the worker polls a
//! safepoint.
//!
//! Locking: queue mutexes are leaves. `arm`, `activate`, and `deactivate`
//! are called with the context lock held and take a queue lock beneath it;
//! `poll` takes a queue lock only to move entries and never while an action
//! body runs, so action bodies are free to take the context lock themselves.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::access::Location;
use crate::error::{ActionError, ActionResult};
use crate::future::HandshakeFuture;
use crate::handshake::{Delivery, Handshake};

/// Delivers pending actions to worker threads at their safepoints.
pub trait SafepointInterrupts: Send + Sync {
    /// Arm delivery of `handshake` on `threads`, returning the completion
    /// future. The future must be observable through the handshake before
    /// any thread can begin executing it.
    fn arm(
        &self,
        threads: &[ThreadId],
        handshake: Arc<Handshake>,
        side_effecting: bool,
        sync_start: bool,
        sync_end: bool,
    ) -> Arc<HandshakeFuture>;

    /// Re-arm delivery on a thread that re-entered the context. Returns
    /// whether the delivery state actually changed.
    fn activate(&self, thread: ThreadId, handshake: &Arc<Handshake>) -> bool;

    /// Disarm delivery on a thread that left the context, counting it as
    /// unreachable for the handshake's future. Returns whether the delivery
    /// state actually changed.
    fn deactivate(&self, thread: ThreadId, handshake: &Arc<Handshake>) -> bool;

    /// Run all actions currently armed for `thread`, in submission order.
    /// Returns how many ran; the first callback error is re-raised after
    /// bookkeeping for every delivery has completed.
    fn poll(&self, thread: ThreadId, location: &Location) -> ActionResult<usize>;
}

#[derive(Default)]
struct ThreadQueue {
    pending: Mutex<VecDeque<Arc<Handshake>>>,
}

/// Per-thread cooperative interrupt queues.
///
/// Workers poll their own queue; the coordinator pushes into it under the
/// context lock. Delivery states on the handshake record which threads have
/// consumed their copy so that re-activation never double-delivers.
#[derive(Default)]
pub struct CooperativeInterrupts {
    queues: DashMap<ThreadId, Arc<ThreadQueue>>,
}

impl CooperativeInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, thread: ThreadId) -> Arc<ThreadQueue> {
        Arc::clone(&self.queues.entry(thread).or_default())
    }

    fn notify_if_last(handshake: &Arc<Handshake>, last: bool) {
        if last {
            if let Some(context) = handshake.context() {
                context.notify_last_done(handshake);
            }
        }
    }
}

impl SafepointInterrupts for CooperativeInterrupts {
    fn arm(
        &self,
        threads: &[ThreadId],
        handshake: Arc<Handshake>,
        _side_effecting: bool,
        _sync_start: bool,
        _sync_end: bool,
    ) -> Arc<HandshakeFuture> {
        let future = Arc::new(HandshakeFuture::armed(threads.len()));
        // Workers read the future through the handshake, so it must be in
        // place before the first enqueue.
        handshake.set_future(Arc::clone(&future));

        for &thread in threads {
            let queue = self.queue(thread);
            let mut pending = queue.pending.lock();
            handshake.delivery_queued(thread);
            pending.push_back(Arc::clone(&handshake));
        }
        future
    }

    fn activate(&self, thread: ThreadId, handshake: &Arc<Handshake>) -> bool {
        if !handshake.is_enabled_for(thread) {
            return false;
        }
        let Some(future) = handshake.future() else {
            return false;
        };
        if future.is_done() || future.is_cancelled() {
            return false;
        }

        let queue = self.queue(thread);
        let mut pending = queue.pending.lock();
        // An existing entry means the thread already consumed or still holds
        // its copy; only threads deactivated earlier (no entry) re-arm.
        if handshake.delivery_state(thread).is_some() {
            return false;
        }
        handshake.delivery_queued(thread);
        future.thread_activated();
        pending.push_back(Arc::clone(handshake));
        true
    }

    fn deactivate(&self, thread: ThreadId, handshake: &Arc<Handshake>) -> bool {
        let Some(queue) = self.queues.get(&thread).map(|q| Arc::clone(&q)) else {
            return false;
        };
        let mut pending = queue.pending.lock();
        let Some(position) = pending.iter().position(|h| Arc::ptr_eq(h, handshake)) else {
            return false;
        };
        pending.remove(position);
        handshake.delivery_cleared(thread);
        if let Some(future) = handshake.future() {
            // The caller holds the context lock; resolution is reported back
            // so completion notification can happen after it is released.
            future.thread_deactivated();
        }
        true
    }

    fn poll(&self, thread: ThreadId, location: &Location) -> ActionResult<usize> {
        // Fast path: threads with no queue have never been targeted.
        let Some(queue) = self.queues.get(&thread).map(|q| Arc::clone(&q)) else {
            return Ok(0);
        };

        // Drain a snapshot of the queue. Action bodies may enqueue more (a
        // self-resubmitting action does every run); those wait for the next
        // poll instead of spinning this one forever. Deliveries are marked
        // done under the queue lock so a concurrent deactivate cannot
        // double-count them.
        let batch: Vec<Arc<Handshake>> = {
            let mut pending = queue.pending.lock();
            pending
                .drain(..)
                .inspect(|handshake| handshake.delivery_done(thread))
                .collect()
        };

        let mut executed = 0;
        let mut first_error = None;
        for handshake in batch {
            let Some(future) = handshake.future().cloned() else {
                continue;
            };
            if future.is_cancelled() {
                let last = future.thread_deactivated();
                Self::notify_if_last(&handshake, last);
                continue;
            }

            future.thread_started();
            let result = handshake.perform(location);
            executed += 1;
            let last = future.thread_finished();
            Self::notify_if_last(&handshake, last);

            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(executed),
        }
    }
}
