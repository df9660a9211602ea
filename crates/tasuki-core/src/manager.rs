//! The context manager contract and its type-erased registry form.
//!
//! A [`ContextManager`] owns one kind of thread-bound contextual state (a
//! correlation map, a security principal, a locale) and knows how to read the
//! calling thread's current value and how to make a value current again on
//! some other thread. Managers are stateless singletons; all per-thread state
//! lives in their storage, one logical slot per thread per manager.
//!
//! Snapshots hold managers of many different value types in one ordered
//! sequence, so the registry works with a type-erased form. The erasure is an
//! internal detail: implementors only ever see their own `Value` type, and a
//! captured value round-trips through `Arc<dyn Any>` back into the same
//! manager that produced it.

use std::any::Any;
use std::sync::Arc;

use tracing::warn;

/// A live activation. Closing restores whatever the owning manager had
/// active on this thread before.
///
/// `close` is idempotent: the second and later calls do nothing. Implementors
/// should also close from `Drop` so that an activation cannot outlive a
/// panicking task.
///
/// Activations are thread-bound by construction: the trait object is not
/// `Send`, so an activation must be closed on the thread that created it.
pub trait ActiveContext {
    fn close(&mut self);
}

/// One kind of propagated thread context.
///
/// Implementations must be cheap to call: `active_value` and `activate` run
/// on every capture and every reactivation, on task-submission paths.
pub trait ContextManager: Send + Sync + 'static {
    /// The propagated value. `Clone` because one snapshot may be reactivated
    /// any number of times, on any number of threads.
    type Value: Clone + Send + Sync + 'static;

    /// Stable name used in logs and debug output.
    fn name(&self) -> &'static str;

    /// The calling thread's current value, or `None` when this manager has
    /// nothing active here. `None` entries are skipped at reactivation.
    fn active_value(&self) -> Option<Self::Value>;

    /// Make `value` current for the calling thread. The returned activation
    /// restores the previous value (possibly "nothing") when closed.
    fn activate(&self, value: Self::Value) -> Box<dyn ActiveContext>;

    /// Drop all of this manager's state on the calling thread.
    ///
    /// Called between pooled tasks so a reused thread starts clean. The
    /// default does nothing, for managers that do not own their storage.
    fn clear_active(&self) {}
}

// ============================================================================
// Type erasure
// ============================================================================

/// A captured value with its concrete type erased.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Object-safe form of [`ContextManager`] used by the registry and snapshots.
///
/// Implemented blanket-wise for every `ContextManager`; never implemented by
/// hand, so a captured value always downcasts in the manager it came from.
pub(crate) trait ErasedManager: Send + Sync {
    fn name(&self) -> &'static str;
    fn capture(&self) -> Option<ErasedValue>;
    fn reactivate(&self, value: &ErasedValue) -> Option<Box<dyn ActiveContext>>;
    fn clear_active(&self);
}

impl<M: ContextManager> ErasedManager for M {
    fn name(&self) -> &'static str {
        ContextManager::name(self)
    }

    fn capture(&self) -> Option<ErasedValue> {
        self.active_value().map(|value| Arc::new(value) as ErasedValue)
    }

    fn reactivate(&self, value: &ErasedValue) -> Option<Box<dyn ActiveContext>> {
        match value.downcast_ref::<M::Value>() {
            Some(value) => Some(self.activate(value.clone())),
            None => {
                warn!(
                    manager = ContextManager::name(self),
                    "captured value has unexpected type, skipping reactivation"
                );
                None
            }
        }
    }

    fn clear_active(&self) {
        ContextManager::clear_active(self);
    }
}

// ============================================================================
// Registered form
// ============================================================================

/// A manager as the registry and snapshots see it: type-erased, shared, with
/// an optional ordering priority.
///
/// Lower priorities come earlier in capture order; managers without a
/// priority come after every prioritized one, in registration order.
#[derive(Clone)]
pub struct RegisteredManager {
    manager: Arc<dyn ErasedManager>,
    priority: Option<i32>,
}

impl RegisteredManager {
    pub fn new<M: ContextManager>(manager: M) -> Self {
        Self { manager: Arc::new(manager), priority: None }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn name(&self) -> &'static str {
        self.manager.name()
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    pub(crate) fn capture(&self) -> Option<ErasedValue> {
        self.manager.capture()
    }

    pub(crate) fn reactivate(&self, value: &ErasedValue) -> Option<Box<dyn ActiveContext>> {
        self.manager.reactivate(value)
    }

    pub(crate) fn clear_active(&self) {
        self.manager.clear_active();
    }
}

impl std::fmt::Debug for RegisteredManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredManager")
            .field("name", &self.name())
            .field("priority", &self.priority)
            .finish()
    }
}
