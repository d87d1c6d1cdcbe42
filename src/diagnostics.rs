//! Diagnostics built on top of the coordinator's own submission API.
//!
//! Both facilities here are ordinary thread-local actions, which keeps the
//! general mechanism honest:
//!
//! - [`StatisticsAction`] is a self-resubmitting, single-thread async action.
//!   Every run records the elapsed time since its previous run and submits
//!   itself again, producing a continuous sampling stream of inter-safepoint
//!   intervals with no external driver. The per-thread aggregates are logged
//!   as one table when the context closes.
//! - [`StackSampleAction`] is a broadcast async action submitted by a timer
//!   thread at a fixed interval; it logs every interrupted thread's current
//!   location for liveness and latency diagnosis.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::access::SafepointAccess;
use crate::action::ThreadLocalAction;
use crate::context::Context;
use crate::error::ActionResult;

/// Origin label for actions submitted by the runtime itself.
pub(crate) const ENGINE_ORIGIN: &str = "engine";

/// Running summary of inter-safepoint intervals for one thread.
#[derive(Debug, Clone, Copy)]
pub struct IntervalStats {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl IntervalStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    pub fn record(&mut self, interval: Duration) {
        self.count += 1;
        self.total += interval;
        self.min = self.min.min(interval);
        self.max = self.max.max(interval);
    }

    pub fn combine(&mut self, other: &IntervalStats) {
        self.count += other.count;
        self.total += other.total;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of safepoint executions: intervals plus one.
    pub fn safepoints(&self) -> u64 {
        self.count + 1
    }

    pub fn average_us(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total.as_secs_f64() * 1_000_000.0 / self.count as f64
    }

    pub fn min_us(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.min.as_secs_f64() * 1_000_000.0
    }

    pub fn max_us(&self) -> f64 {
        self.max.as_secs_f64() * 1_000_000.0
    }
}

impl Default for IntervalStats {
    fn default() -> Self {
        Self::new()
    }
}

struct SampleState {
    prev: Option<Instant>,
    intervals: IntervalStats,
}

/// Per-thread interval collector; see the module docs.
pub struct StatisticsAction {
    context: Weak<Context>,
    me: Weak<StatisticsAction>,
    thread_name: String,
    state: Mutex<SampleState>,
}

impl StatisticsAction {
    fn for_current_thread(context: &Arc<Context>) -> Arc<Self> {
        let current = thread::current();
        let thread_name = current
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Arc::new_cyclic(|me| Self {
            context: Arc::downgrade(context),
            me: me.clone(),
            thread_name,
            state: Mutex::new(SampleState {
                prev: None,
                intervals: IntervalStats::new(),
            }),
        })
    }

    pub(crate) fn snapshot(&self) -> (String, IntervalStats) {
        (self.thread_name.clone(), self.state.lock().intervals)
    }
}

impl ThreadLocalAction for StatisticsAction {
    fn side_effecting(&self) -> bool {
        false
    }

    fn synchronous(&self) -> bool {
        false
    }

    fn label(&self) -> &str {
        "safepoint-statistics"
    }

    fn perform(&self, access: &SafepointAccess) -> ActionResult<()> {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            // The first run has no prior timestamp and records nothing.
            if let Some(prev) = state.prev {
                state.intervals.record(now.saturating_duration_since(prev));
            }
        }

        let thread = access.thread()?;
        if let (Some(context), Some(me)) = (self.context.upgrade(), self.me.upgrade()) {
            // Re-arm for the next safepoint crossing. Submitting against a
            // closed context yields a resolved future and ends the stream.
            context.submit(Some(&[thread]), ENGINE_ORIGIN, me, false)?;
        }

        self.state.lock().prev = Some(Instant::now());
        Ok(())
    }
}

/// Create the calling thread's collector, register it for the close-time
/// report, and start its sampling stream. Invoked on a thread's first enter.
pub(crate) fn install_statistics_for_current_thread(context: &Arc<Context>) {
    let collector = StatisticsAction::for_current_thread(context);
    {
        let mut inner = context.inner.lock();
        match inner.statistics.as_mut() {
            Some(list) => list.push(Arc::clone(&collector)),
            // Statistics were turned off or already reported.
            None => return,
        }
    }
    let thread = thread::current().id();
    let _ = context.submit(Some(&[thread]), ENGINE_ORIGIN, collector, false);
}

/// Log the close-time statistics table and the context-wide aggregate.
pub(crate) fn log_statistics(statistics: &[Arc<StatisticsAction>]) {
    use std::fmt::Write;

    let mut all = IntervalStats::new();
    let mut table = String::new();
    let _ = writeln!(
        table,
        "  --------------------------------------------------------------------------------------"
    );
    let _ = writeln!(
        table,
        "   Thread Name         Safepoints | Interval     Avg              Min              Max"
    );
    let _ = writeln!(
        table,
        "  --------------------------------------------------------------------------------------"
    );
    for collector in statistics {
        let (name, intervals) = collector.snapshot();
        all.combine(&intervals);
        format_statistic_line(&mut table, &format!("  {name}"), &intervals);
    }
    let _ = writeln!(
        table,
        "  --------------------------------------------------------------------------------------"
    );
    format_statistic_line(&mut table, "  All threads", &all);
    log::info!(target: "parley", "Safepoint Statistics\n{table}");
}

fn format_statistic_line(out: &mut String, label: &str, stats: &IntervalStats) {
    use std::fmt::Write;
    let _ = writeln!(
        out,
        " {:<20}  {:>10} | {:>16.3} us  {:>12.1} us  {:>12.1} us",
        label,
        stats.safepoints(),
        stats.average_us(),
        stats.min_us(),
        stats.max_us()
    );
}

/// Broadcast action logging each interrupted thread's current location.
pub struct StackSampleAction;

impl ThreadLocalAction for StackSampleAction {
    fn side_effecting(&self) -> bool {
        false
    }

    fn synchronous(&self) -> bool {
        false
    }

    fn label(&self) -> &str {
        "stack-sample"
    }

    fn perform(&self, access: &SafepointAccess) -> ActionResult<()> {
        let location = access.location()?;
        let current = thread::current();
        log::info!(
            target: "parley",
            "Stack Trace Thread {}: {}",
            current.name().unwrap_or("unnamed"),
            location
        );
        Ok(())
    }
}

/// Cancellation handle for the sampler timer thread. Dropping it (without
/// calling [`SamplerHandle::cancel`]) also stops the timer, since the
/// channel disconnects.
pub(crate) struct SamplerHandle {
    cancel: Sender<()>,
}

impl SamplerHandle {
    pub(crate) fn cancel(&self) {
        let _ = self.cancel.send(());
    }
}

/// Spawn the periodic sampler: every `interval` it submits a broadcast
/// [`StackSampleAction`] until cancelled or the context is dropped.
pub(crate) fn start_sampler(context: &Arc<Context>, interval: Duration) -> SamplerHandle {
    let (cancel, cancelled) = channel::bounded(1);
    let weak = Arc::downgrade(context);
    let builder = thread::Builder::new().name("parley-sampler".to_owned());
    let spawned = builder.spawn(move || loop {
        match cancelled.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let Some(context) = weak.upgrade() else {
                    break;
                };
                let _ = context.submit(None, ENGINE_ORIGIN, Arc::new(StackSampleAction), false);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    });
    if let Err(err) = spawned {
        log::warn!(target: "parley", "failed to spawn sampler thread: {err}");
    }
    SamplerHandle { cancel }
}
