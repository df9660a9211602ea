//! Context snapshots: capture on one thread, reactivate on another.
//!
//! A [`ContextSnapshot`] is an immutable record of every registered manager's
//! current value at one moment on one thread. Reactivating it replays those
//! values in capture order and hands back a [`ReactivatedContext`] that
//! restores the executing thread's prior state in exact reverse order, like
//! unwinding a stack of nested scopes.
//!
//! ```text
//! submitting thread                     executing thread
//!       │                                     │
//!  capture_snapshot()                         │
//!       │            ContextSnapshot          │
//!       ├────────────── (Send) ──────────────►│
//!       │                               reactivate()
//!       │                                     │  managers activated in order
//!       │                                     │  task runs
//!       │                                close()
//!       │                                     │  activations closed in reverse
//! ```
//!
//! Misbehaving managers are contained at every step: a panic during capture
//! records that manager as absent, a panic during activation skips it, and a
//! panic during close still lets the remaining activations close.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::{trace, warn};

use crate::manager::{ActiveContext, ErasedValue, RegisteredManager};
use crate::registry::ManagerRegistry;

struct CapturedEntry {
    manager: RegisteredManager,
    /// `None` when the manager had nothing active, or when capture panicked.
    value: Option<ErasedValue>,
}

/// Immutable capture of one thread's full context.
///
/// Cheap to clone and safe to send across threads; one snapshot can be
/// reactivated any number of times, concurrently. Managers registered after
/// the capture take no part in it.
#[derive(Clone)]
pub struct ContextSnapshot {
    entries: Arc<[CapturedEntry]>,
}

impl ContextSnapshot {
    /// Capture from the process-wide registry.
    pub fn capture() -> Self {
        Self::capture_from(ManagerRegistry::global())
    }

    /// Capture the calling thread's context across `registry`'s managers.
    pub fn capture_from(registry: &ManagerRegistry) -> Self {
        let started = Instant::now();
        let managers = registry.managers();
        let mut entries = Vec::with_capacity(managers.len());
        for manager in managers.iter() {
            let value = match catch_unwind(AssertUnwindSafe(|| manager.capture())) {
                Ok(value) => value,
                Err(_) => {
                    warn!(manager = manager.name(), "context capture panicked, treating as absent");
                    None
                }
            };
            entries.push(CapturedEntry { manager: manager.clone(), value });
        }
        trace!(
            managers = entries.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "captured context snapshot"
        );
        Self { entries: entries.into() }
    }

    /// Replay the captured values on the calling thread.
    ///
    /// Absent entries are skipped. Activation runs in capture order; the
    /// returned composite closes in exact reverse order. A manager that
    /// panics here is skipped, and the rest still activate.
    pub fn reactivate(&self) -> ReactivatedContext {
        let started = Instant::now();
        let mut guards = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            let Some(value) = &entry.value else { continue };
            match catch_unwind(AssertUnwindSafe(|| entry.manager.reactivate(value))) {
                Ok(Some(guard)) => guards.push((entry.manager.name(), guard)),
                // Downcast mismatch, already logged by the manager layer.
                Ok(None) => {}
                Err(_) => {
                    warn!(
                        manager = entry.manager.name(),
                        "context reactivation panicked, skipping"
                    );
                }
            }
        }
        trace!(
            activated = guards.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "reactivated context snapshot"
        );
        ReactivatedContext { guards, closed: false }
    }

    /// Turn a task into one that runs under this snapshot.
    ///
    /// The returned closure reactivates, runs `task`, and restores the
    /// executing thread's prior context, panics included. This is the
    /// one-shot adapter for `std::thread::spawn`-style APIs.
    pub fn wrap<R>(self, task: impl FnOnce() -> R) -> impl FnOnce() -> R {
        move || {
            let mut active = self.reactivate();
            let result = task();
            active.close();
            result
        }
    }
}

impl std::fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let managers: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.manager.name(), entry.value.is_some()))
            .collect();
        f.debug_struct("ContextSnapshot").field("managers", &managers).finish()
    }
}

/// Live composite of every activation made by one `reactivate` call.
///
/// Closing restores the prior value of each manager, newest first, so nested
/// thread-bound state unwinds the way it was built. `close` is idempotent and
/// runs from `Drop` if the holder forgets or panics.
///
/// Not `Send`: the composite must be closed on the thread that reactivated.
pub struct ReactivatedContext {
    guards: Vec<(&'static str, Box<dyn ActiveContext>)>,
    closed: bool,
}

impl ReactivatedContext {
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (name, guard) in self.guards.iter_mut().rev() {
            if catch_unwind(AssertUnwindSafe(|| guard.close())).is_err() {
                warn!(manager = *name, "context close panicked, continuing with the rest");
            }
        }
        self.guards.clear();
    }
}

impl Drop for ReactivatedContext {
    fn drop(&mut self) {
        self.close();
    }
}
