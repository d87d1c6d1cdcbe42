//! Configuration surface for a context's thread-local action machinery.

use std::time::Duration;

/// Tunables read by the coordinator and the diagnostics subsystem.
///
/// The live configuration is stored in an `ArcSwap` on the context so that
/// hot paths (tracing checks, enter/leave) can read it without taking the
/// context lock. `Context::on_patch` replaces it wholesale.
///
/// # Examples
///
/// ```
/// use parley::ActionsConfig;
/// use std::time::Duration;
///
/// let config = ActionsConfig {
///     safepoint_statistics: true,
///     trace_actions: true,
///     stack_sample_interval: Some(Duration::from_millis(100)),
/// };
/// assert!(config.diagnostics_enabled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActionsConfig {
    /// Collect per-thread safepoint interval statistics and log an aggregate
    /// table when the context closes.
    pub safepoint_statistics: bool,
    /// Emit a `[tl]` trace line for every submission, start, success,
    /// failure, and cancellation.
    pub trace_actions: bool,
    /// Fire a broadcast stack-sampling action at this interval. `None`
    /// disables the sampler.
    pub stack_sample_interval: Option<Duration>,
}

impl ActionsConfig {
    /// Whether any diagnostics output is configured at all.
    pub fn diagnostics_enabled(&self) -> bool {
        self.safepoint_statistics || self.trace_actions || self.stack_sample_interval.is_some()
    }
}
