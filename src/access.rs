//! Safepoint access capability handed to action bodies.
//!
//! A [`SafepointAccess`] is a validated view of "where" a worker thread was
//! interrupted. It is thread-confined and short-lived: the execution wrapper
//! invalidates it the moment the action body returns, so a stashed clone
//! observed later (or from another thread) fails with a usage error instead
//! of exposing stale state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::{ActionError, ActionResult};

/// An opaque description of a worker thread's current execution point.
///
/// Workers report their location when polling safepoints; the stack sampler
/// logs it and action bodies can read it through [`SafepointAccess`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    label: Arc<str>,
}

impl Location {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
        }
    }

    /// Placeholder for callers that cannot name their execution point.
    pub fn unknown() -> Self {
        Self::new("<unknown>")
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

struct AccessInner {
    thread: ThreadId,
    location: Location,
    invalid: AtomicBool,
}

/// The interrupted thread's identity and location, valid only on that thread
/// and only until the action body returns.
///
/// # Examples
///
/// ```ignore
/// let action = CallbackAction::new(false, false, |access| {
///     log::info!("interrupted at {}", access.location()?);
///     Ok(())
/// });
/// ```
#[derive(Clone)]
pub struct SafepointAccess {
    inner: Arc<AccessInner>,
}

impl SafepointAccess {
    pub(crate) fn new(thread: ThreadId, location: Location) -> Self {
        Self {
            inner: Arc::new(AccessInner {
                thread,
                location,
                invalid: AtomicBool::new(false),
            }),
        }
    }

    /// The execution point at which the thread was interrupted.
    pub fn location(&self) -> ActionResult<Location> {
        self.check_valid()?;
        Ok(self.inner.location.clone())
    }

    /// The interrupted thread, which is always the calling thread.
    pub fn thread(&self) -> ActionResult<ThreadId> {
        self.check_valid()?;
        Ok(thread::current().id())
    }

    pub(crate) fn invalidate(&self) {
        self.inner.invalid.store(true, Ordering::Release);
    }

    fn check_valid(&self) -> ActionResult<()> {
        if self.inner.thread != thread::current().id() {
            return Err(ActionError::AccessWrongThread);
        }
        if self.inner.invalid.load(Ordering::Acquire) {
            return Err(ActionError::AccessInvalidated);
        }
        Ok(())
    }
}

impl fmt::Debug for SafepointAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafepointAccess")
            .field("thread", &self.inner.thread)
            .field("location", &self.inner.location)
            .field("invalid", &self.inner.invalid.load(Ordering::Relaxed))
            .finish()
    }
}
