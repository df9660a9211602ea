//! Thread-context capture and restoration for task handoff.
//!
//! Code that submits work to another thread usually loses everything that
//! was ambient on the submitting thread: correlation IDs, security
//! principals, locale, tracing state. tasuki snapshots that ambient state
//! across every registered [`ContextManager`] and reproduces it on the
//! executing thread, with guaranteed restoration of whatever was there
//! before, even when the task panics.
//!
//! # Protocol
//!
//! ```text
//! submitting thread                          executing thread
//!       │                                          │
//!  capture_snapshot()        Send                  │
//!       │  ContextSnapshot ──────────────►  reactivate()
//!       │                                          │   values current, in
//!       │                                          │   capture order
//!       │                                          │   ... task runs ...
//!       │                                     close()
//!       │                                          │   prior state restored,
//!       │                                          │   reverse order
//! ```
//!
//! Managers are discovered through link-time [`ManagerProvider`]
//! submissions and runtime [`ManagerRegistry::register`] calls. One
//! misbehaving manager is logged and contained at every step; it never
//! breaks capture, reactivation, or close for the others.
//!
//! # Example
//!
//! ```ignore
//! use tasuki_core::{ContextAwareExecutor, SpawnExecutor, TaskExecutor};
//!
//! // Any executor can be decorated; tasks then run under the context
//! // of whichever thread submitted them.
//! let executor = ContextAwareExecutor::new(SpawnExecutor);
//! executor.execute(Box::new(|| {
//!     // correlation IDs, principals, ... from the submitting thread
//! }));
//!
//! // One-shot handoff without an executor:
//! let task = tasuki_core::capture_snapshot().wrap(|| do_work());
//! std::thread::spawn(task);
//! ```

mod error;
mod executor;
mod future;
mod manager;
mod registry;
mod slot;
mod snapshot;
mod wrap;

#[cfg(test)]
mod test_support;

pub use error::ContextError;
pub use executor::{ContextAwareExecutor, SpawnExecutor, Task, TaskError, TaskExecutor, TaskHandle};
pub use future::{FutureExt, WithContextFuture};
pub use manager::{ActiveContext, ContextManager, RegisteredManager};
pub use registry::{ManagerProvider, ManagerRegistry};
pub use slot::{ContextSlot, SlotGuard, SlotStack};
pub use snapshot::{ContextSnapshot, ReactivatedContext};
pub use wrap::{
    BiFnWithContext, BiPredicateWithContext, CallWithContext, FnWithContext, PredicateWithContext,
    SnapshotConsumer, SnapshotSource,
};

/// Result type for wrapper construction.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Capture the calling thread's context across the process-wide registry.
pub fn capture_snapshot() -> ContextSnapshot {
    ContextSnapshot::capture()
}

/// Drop every registered manager's state on the calling thread.
pub fn clear_active_contexts() {
    ManagerRegistry::global().clear_active_contexts()
}
