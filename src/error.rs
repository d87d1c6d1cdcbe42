//! Error types for the parley runtime.

use thiserror::Error;

/// Errors surfaced by action submission, safepoint access, and action bodies.
///
/// Usage errors (`RecursiveSyncAction`, `AccessWrongThread`,
/// `AccessInvalidated`, `ContextClosed`) are reported synchronously to the
/// caller and never corrupt coordinator bookkeeping. Errors produced by
/// action callbacks (`Guest`, `Failed`) are traced and re-raised to whoever
/// drives the safepoint poll. Internal consistency violations are not
/// represented here at all; those panic.
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// A synchronous action was submitted from inside a synchronous action
    /// already running on the same thread.
    #[error(
        "recursive synchronous thread-local action detected; \
         they are disallowed as they may cause deadlocks, \
         schedule an asynchronous thread-local action instead"
    )]
    RecursiveSyncAction,

    /// A `SafepointAccess` was used from a thread other than the one it was
    /// created on.
    #[error("safepoint access used on the wrong thread")]
    AccessWrongThread,

    /// A `SafepointAccess` was used after its action body returned.
    #[error("safepoint access is no longer valid")]
    AccessInvalidated,

    /// The context is closed and can no longer be entered.
    #[error("context is already closed")]
    ContextClosed,

    /// A guest-level error raised by an action body. Escaping a
    /// non-side-effecting action with one of these is a fatal internal
    /// violation handled by the execution wrapper.
    #[error("guest error in thread-local action: {0}")]
    Guest(String),

    /// A host-level failure raised by an action body.
    #[error("thread-local action failed: {0}")]
    Failed(String),
}

impl ActionError {
    /// Whether this error models a guest-visible condition.
    pub fn is_guest(&self) -> bool {
        matches!(self, ActionError::Guest(_))
    }
}

/// Result type for parley operations.
pub type ActionResult<T> = Result<T, ActionError>;
