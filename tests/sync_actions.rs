//! Synchronous submission: completion blocking, recursion rejection, and
//! the start/end synchronization split.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use common::Worker;
use crossbeam::channel;
use parking_lot::Mutex;
use parley::{ActionError, ActionsConfig, CallbackAction, Context};

#[test]
fn synchronous_submission_blocks_until_all_targets_ran() {
    let context = Context::new(ActionsConfig::default());
    let worker_a = Worker::spawn(&context, "worker-a");
    let worker_b = Worker::spawn(&context, "worker-b");

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    let action = Arc::new(CallbackAction::new(false, true, move |_| {
        runs_clone.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }));

    let future = context.submit(None, "test", action, false).unwrap();

    // The submitter only gets here once every target executed.
    assert!(future.is_done());
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    worker_a.stop();
    worker_b.stop();
    context.close(false);
}

#[test]
fn synchronous_submission_to_single_thread_ignores_others() {
    let context = Context::new(ActionsConfig::default());
    let worker_a = Worker::spawn(&context, "worker-a");
    let worker_b = Worker::spawn(&context, "worker-b");

    let threads: Arc<Mutex<HashSet<ThreadId>>> = Arc::default();
    let threads_clone = Arc::clone(&threads);
    let action = Arc::new(CallbackAction::new(false, true, move |access| {
        threads_clone.lock().insert(access.thread()?);
        Ok(())
    }));

    let future = context
        .submit(Some(&[worker_a.thread]), "test", action, false)
        .unwrap();

    assert!(future.is_done());
    let seen = threads.lock().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen.contains(&worker_a.thread));

    // The other worker ran nothing.
    worker_a.stop();
    assert_eq!(worker_b.stop(), 0);
    context.close(false);
}

#[test]
fn recursive_synchronous_submission_is_rejected() {
    let context = Context::new(ActionsConfig::default());
    let worker = Worker::spawn(&context, "worker");

    let rejected = Arc::new(AtomicBool::new(false));
    let rejected_clone = Arc::clone(&rejected);
    let context_clone = Arc::clone(&context);
    let target = worker.thread;

    let outer = Arc::new(CallbackAction::new(false, true, move |_| {
        let inner = Arc::new(CallbackAction::new(false, true, |_| Ok(())));
        match context_clone.submit(Some(&[target]), "test", inner, false) {
            Err(ActionError::RecursiveSyncAction) => {
                rejected_clone.store(true, Ordering::Release);
            }
            other => panic!("expected recursion rejection, got {other:?}"),
        }
        Ok(())
    }));

    let future = context
        .submit(Some(&[worker.thread]), "test", outer, false)
        .unwrap();
    assert!(future.is_done());
    assert!(rejected.load(Ordering::Acquire));

    worker.stop();
    context.close(false);
}

#[test]
fn sync_start_returns_before_the_body_finishes() {
    let context = Context::new(ActionsConfig::default());
    let worker = Worker::spawn(&context, "worker");

    let (release, released) = channel::bounded::<()>(1);
    let action = Arc::new(CallbackAction::new(false, true, move |_| {
        let _ = released.recv();
        Ok(())
    }));

    let future = context
        .submit_with(None, "test", action, false, true, false, false)
        .unwrap();

    // Every target has begun, but the body is still blocked.
    assert!(!future.is_done());
    release.send(()).unwrap();
    future.wait();

    worker.stop();
    context.close(false);
}

#[test]
fn submitter_that_is_a_target_drains_its_own_queue() {
    let context = Context::new(ActionsConfig::default());
    let guard = context.enter().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    let action = Arc::new(CallbackAction::new(false, true, move |_| {
        runs_clone.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }));

    // The only active thread is the submitter itself; the sync wait must
    // execute the action on this thread instead of deadlocking.
    let future = context.submit(None, "test", action, false).unwrap();
    assert!(future.is_done());
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    drop(guard);
    context.close(false);
}

#[test]
fn stale_queue_failure_does_not_abandon_a_sync_wait() {
    let context = Context::new(ActionsConfig::default());
    let worker = Worker::spawn(&context, "worker");
    let guard = context.enter().unwrap();

    // A failing async action sits in the submitter's own queue before the
    // synchronous submission; its error surfaces while the submitter drains
    // during the wait and must not cut the wait short.
    let (failed_tx, failed_rx) = channel::bounded::<()>(1);
    let failing = Arc::new(CallbackAction::new(true, false, move |_| {
        failed_tx.send(()).ok();
        Err(ActionError::Failed("stale entry".into()))
    }));
    context
        .submit(Some(&[std::thread::current().id()]), "test", failing, false)
        .unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    let sync = Arc::new(CallbackAction::new(false, true, move |_| {
        // Holds the future pending until the submitter has drained the
        // failing entry.
        let _ = failed_rx.recv();
        runs_clone.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }));
    let result = context.submit(Some(&[worker.thread]), "test", sync, false);

    // The error is re-raised, but only after the target finished.
    assert!(matches!(result, Err(ActionError::Failed(_))));
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    worker.stop();
    assert!(!context.has_active_events());
    drop(guard);
    context.close(false);
}

#[test]
fn action_error_propagates_to_the_polling_worker() {
    let context = Context::new(ActionsConfig::default());
    let guard = context.enter().unwrap();

    let action = Arc::new(CallbackAction::new(true, false, |_| {
        Err(ActionError::Failed("probe failure".into()))
    }));
    let future = context.submit(None, "test", action, false).unwrap();

    let err = context
        .poll_safepoint(&parley::Location::new("test-loop"))
        .unwrap_err();
    assert!(matches!(err, ActionError::Failed(_)));

    // Bookkeeping is independent of the callback's outcome.
    assert!(future.is_done());
    assert!(!context.has_active_events());

    drop(guard);
    context.close(false);
}
