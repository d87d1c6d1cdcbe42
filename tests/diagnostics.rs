//! Statistics and sampler diagnostics driven through real polling workers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::Worker;
use parley::{ActionsConfig, CallbackAction, Context, Location};

#[test]
fn statistics_stream_rides_on_regular_polling() {
    let config = ActionsConfig {
        safepoint_statistics: true,
        ..Default::default()
    };
    let context = Context::new(config);
    let worker = Worker::spawn(&context, "stats-worker");

    // The per-thread collector resubmits itself, so every poll runs it again
    // without any further submissions from here.
    thread::sleep(Duration::from_millis(20));
    let executed = worker.stop();
    assert!(executed >= 2, "collector ran only {executed} times");

    // Normal close reports the table; the dangling resubmission was disarmed
    // when the worker left.
    context.close(false);
    assert!(!context.has_active_events());
}

#[test]
fn statistics_and_user_actions_share_the_queue() {
    let config = ActionsConfig {
        safepoint_statistics: true,
        trace_actions: true,
        ..Default::default()
    };
    let context = Context::new(config);
    let worker = Worker::spawn(&context, "mixed-worker");

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    let future = context
        .submit(
            None,
            "test",
            Arc::new(CallbackAction::new(false, false, move |_| {
                runs_clone.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })),
            false,
        )
        .unwrap();

    future.wait();
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    worker.stop();
    context.close(false);
}

#[test]
fn sampler_delivers_stack_samples_to_polling_workers() {
    let config = ActionsConfig {
        stack_sample_interval: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    let context = Context::new(config);
    let worker = Worker::spawn(&context, "sampled-worker");

    thread::sleep(Duration::from_millis(100));
    let executed = worker.stop();
    assert!(executed >= 1, "no stack sample arrived within 100ms");

    context.close(false);
    assert!(!context.has_active_events());
}

#[test]
fn store_and_patch_keep_the_context_usable() {
    let config = ActionsConfig {
        stack_sample_interval: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    let context = Context::new(config);

    // Persisting stops the timer; patching restores a fresh configuration.
    context.prepare_store();
    context.on_patch(ActionsConfig {
        safepoint_statistics: true,
        ..Default::default()
    });

    let guard = context.enter().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    context
        .submit(
            None,
            "test",
            Arc::new(CallbackAction::new(false, false, move |_| {
                runs_clone.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })),
            false,
        )
        .unwrap();
    context.poll_safepoint(&Location::new("patched-loop")).unwrap();
    assert!(runs.load(Ordering::Relaxed) >= 1);

    // Drain the resubmitted collector before leaving.
    context.poll_safepoint(&Location::new("patched-loop")).unwrap();
    drop(guard);
    context.close(false);
}
