//! Worker-thread harness shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel;
use crossbeam::utils::Backoff;
use parley::{Context, Location};

/// A worker that enters the context and polls safepoints until stopped.
pub struct Worker {
    pub thread: ThreadId,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<usize>,
}

impl Worker {
    pub fn spawn(context: &Arc<Context>, name: &str) -> Worker {
        let (ready_tx, ready_rx) = channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let context = Arc::clone(context);

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let guard = context.enter().unwrap();
                ready_tx.send(thread::current().id()).unwrap();

                // Adaptive spin/yield between polls, as a mutator loop would.
                let backoff = Backoff::new();
                let location = Location::new("worker-loop");
                let mut executed = 0;
                while !stop_flag.load(Ordering::Acquire) {
                    executed += context.poll_safepoint(&location).unwrap();
                    backoff.snooze();
                }
                // Drain whatever arrived since the last iteration before
                // leaving, so pending actions run instead of deactivating.
                executed += context.poll_safepoint(&location).unwrap();
                drop(guard);
                executed
            })
            .unwrap();

        let thread = ready_rx.recv().unwrap();
        Worker {
            thread,
            stop,
            handle,
        }
    }

    /// Stop the polling loop and return how many actions the worker ran.
    pub fn stop(self) -> usize {
        self.stop.store(true, Ordering::Release);
        self.handle.join().unwrap()
    }
}

/// A worker that enters the context and then blocks without ever polling,
/// until released. Used to exercise the deactivate-on-leave path.
pub struct ParkedWorker {
    pub thread: ThreadId,
    release: channel::Sender<()>,
    handle: JoinHandle<()>,
}

impl ParkedWorker {
    pub fn spawn(context: &Arc<Context>, name: &str) -> ParkedWorker {
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (release, released) = channel::bounded(1);
        let context = Arc::clone(context);

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let guard = context.enter().unwrap();
                ready_tx.send(thread::current().id()).unwrap();
                let _ = released.recv();
                drop(guard);
            })
            .unwrap();

        let thread = ready_rx.recv().unwrap();
        ParkedWorker {
            thread,
            release,
            handle,
        }
    }

    /// Let the worker leave the context without having polled.
    pub fn release(self) {
        let _ = self.release.send(());
        self.handle.join().unwrap();
    }
}
