//! Cooperative thread-local action handshakes for shared execution contexts.
//!
//! `parley` coordinates the execution of arbitrary actions on a dynamic set
//! of worker threads without the submitting thread controlling those workers
//! directly. Workers cooperate by polling *safepoints*; when a worker reaches
//! one, it runs every action currently pending for it.
//!
//! ## Architecture
//!
//! - **Context & coordinator**: a single lock per [`Context`] guards the
//!   thread registry and the active handshake set. The lock covers
//!   bookkeeping only and is never held while an action body runs.
//! - **Handshake model**: each submission becomes a [`Handshake`] bound to
//!   the threads active at submission time, tracked until every target has
//!   executed the action or been confirmed unreachable, with a
//!   [`HandshakeFuture`] for completion and cancellation.
//! - **Interrupt capability**: cross-thread delivery is behind the
//!   [`SafepointInterrupts`] trait; [`CooperativeInterrupts`] implements it
//!   as one FIFO queue per worker thread.
//! - **Diagnostics**: safepoint-interval statistics and periodic stack
//!   sampling are themselves actions routed through the same coordinator.
//!
//! ## Usage
//!
//! ```
//! use parley::{ActionsConfig, CallbackAction, Context, Location};
//! use std::sync::Arc;
//!
//! let context = Context::new(ActionsConfig::default());
//!
//! // A worker thread associates itself and polls from its hot loop.
//! let guard = context.enter().unwrap();
//!
//! let future = context
//!     .submit(
//!         None, // all active threads
//!         "tooling",
//!         Arc::new(CallbackAction::new(false, false, |access| {
//!             let _ = access.location()?;
//!             Ok(())
//!         })),
//!         false,
//!     )
//!     .unwrap();
//!
//! context.poll_safepoint(&Location::new("demo-loop")).unwrap();
//! assert!(future.is_done());
//!
//! drop(guard);
//! context.close(false);
//! ```

pub mod access;
pub mod action;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod future;
pub mod handshake;
pub mod interrupt;

pub use access::{Location, SafepointAccess};
pub use action::{CallbackAction, ThreadLocalAction};
pub use config::ActionsConfig;
pub use context::{Context, ContextGuard, ContextState};
pub use diagnostics::{IntervalStats, StackSampleAction, StatisticsAction};
pub use error::{ActionError, ActionResult};
pub use future::HandshakeFuture;
pub use handshake::Handshake;
pub use interrupt::{CooperativeInterrupts, SafepointInterrupts};
