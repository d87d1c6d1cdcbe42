//! The unit of work delivered to worker threads at safepoints.

use crate::access::SafepointAccess;
use crate::error::ActionResult;

/// A callback executed on targeted worker threads when they reach a
/// safepoint.
///
/// The two flags are fixed properties of the action and drive the completion
/// protocol:
///
/// - **side-effecting**: the action may observably affect guest state.
///   Non-side-effecting actions are assumed incapable of raising guest
///   errors; one escaping anyway is a fatal internal violation.
/// - **synchronous**: the submitter blocks until every targeted thread has
///   executed the action or become unreachable. Submitting a synchronous
///   action from inside one already running on the same thread is rejected.
///
/// Actions targeting several threads run once per thread, so `perform` must
/// be safe to call concurrently.
pub trait ThreadLocalAction: Send + Sync {
    /// Whether this action may affect guest-observable state.
    fn side_effecting(&self) -> bool;

    /// Whether the submitter waits for completion across all targets.
    fn synchronous(&self) -> bool;

    /// Short label used in trace lines.
    fn label(&self) -> &str {
        "thread-local-action"
    }

    /// Run the action on the interrupted thread. `access` is invalidated as
    /// soon as this returns.
    fn perform(&self, access: &SafepointAccess) -> ActionResult<()>;
}

/// Closure adapter for [`ThreadLocalAction`].
///
/// # Examples
///
/// ```
/// use parley::CallbackAction;
///
/// let action = CallbackAction::new(false, false, |_access| Ok(()));
/// ```
pub struct CallbackAction<F> {
    side_effecting: bool,
    synchronous: bool,
    label: &'static str,
    callback: F,
}

impl<F> CallbackAction<F>
where
    F: Fn(&SafepointAccess) -> ActionResult<()> + Send + Sync,
{
    pub fn new(side_effecting: bool, synchronous: bool, callback: F) -> Self {
        Self {
            side_effecting,
            synchronous,
            label: "callback",
            callback,
        }
    }

    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }
}

impl<F> ThreadLocalAction for CallbackAction<F>
where
    F: Fn(&SafepointAccess) -> ActionResult<()> + Send + Sync,
{
    fn side_effecting(&self) -> bool {
        self.side_effecting
    }

    fn synchronous(&self) -> bool {
        self.synchronous
    }

    fn label(&self) -> &str {
        self.label
    }

    fn perform(&self, access: &SafepointAccess) -> ActionResult<()> {
        (self.callback)(access)
    }
}
