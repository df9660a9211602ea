//! Thread-local stack storage for context managers.
//!
//! A [`ContextSlot`] gives a manager one logical "current value" per thread,
//! backed by a stack so that nested activations unwind in LIFO order. Managers
//! are free to bring their own storage; the slot is the default for values
//! whose lifetime is exactly the activation.
//!
//! Out-of-order closes are tolerated: closing a guard that is no longer on
//! top removes its entry without disturbing newer activations, so the newest
//! remaining value stays current.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::thread::LocalKey;

use tracing::debug;

use crate::manager::ActiveContext;

/// Per-thread stack cell behind a [`ContextSlot`].
///
/// Declared by the manager crate inside a `thread_local!` block:
///
/// ```ignore
/// thread_local! {
///     static STACK: RefCell<SlotStack<Principal>> = RefCell::new(SlotStack::new());
/// }
/// static SLOT: ContextSlot<Principal> = ContextSlot::new(&STACK);
/// ```
pub struct SlotStack<T> {
    entries: Vec<SlotEntry<T>>,
    next_id: u64,
}

struct SlotEntry<T> {
    id: u64,
    value: T,
}

impl<T> SlotStack<T> {
    pub const fn new() -> Self {
        Self { entries: Vec::new(), next_id: 0 }
    }
}

impl<T> Default for SlotStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a per-thread value stack.
///
/// Copyable; all copies refer to the same `thread_local!` storage. The value
/// seen through the slot is always the most recent activation on the calling
/// thread that has not been closed.
pub struct ContextSlot<T: 'static> {
    key: &'static LocalKey<RefCell<SlotStack<T>>>,
}

impl<T: 'static> Clone for ContextSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> Copy for ContextSlot<T> {}

impl<T: 'static> ContextSlot<T> {
    pub const fn new(key: &'static LocalKey<RefCell<SlotStack<T>>>) -> Self {
        Self { key }
    }

    /// The calling thread's current value, if any.
    pub fn current(&self) -> Option<T>
    where
        T: Clone,
    {
        self.key
            .with(|stack| stack.borrow().entries.last().map(|entry| entry.value.clone()))
    }

    /// Whether the calling thread has an active value.
    pub fn is_active(&self) -> bool {
        self.key.with(|stack| !stack.borrow().entries.is_empty())
    }

    /// Make `value` current for the calling thread until the guard closes.
    pub fn activate(&self, value: T) -> SlotGuard<T> {
        let id = self.key.with(|stack| {
            let mut stack = stack.borrow_mut();
            let id = stack.next_id;
            stack.next_id += 1;
            stack.entries.push(SlotEntry { id, value });
            id
        });
        SlotGuard { slot: *self, id, closed: false, _not_send: PhantomData }
    }

    /// Drop every value on the calling thread's stack.
    ///
    /// Guards handed out earlier remain safe to close; their entries are
    /// already gone, so the close is a no-op.
    pub fn clear(&self) {
        self.key.with(|stack| stack.borrow_mut().entries.clear());
    }
}

/// Restores the slot's previous value when closed.
///
/// `close` is idempotent. Dropping an unclosed guard closes it, so values
/// cannot leak past a panic.
pub struct SlotGuard<T: 'static> {
    slot: ContextSlot<T>,
    id: u64,
    closed: bool,
    // Thread-bound: closing on another thread would edit that thread's stack.
    _not_send: PhantomData<*const ()>,
}

impl<T: 'static> SlotGuard<T> {
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // try_with: the guard may be dropped during thread teardown, after
        // the thread-local storage is gone.
        let _ = self.slot.key.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.entries.iter().rposition(|entry| entry.id == self.id) {
                Some(position) => {
                    stack.entries.remove(position);
                }
                None => debug!("slot entry already removed, close is a no-op"),
            }
        });
    }
}

impl<T: 'static> ActiveContext for SlotGuard<T> {
    fn close(&mut self) {
        SlotGuard::close(self);
    }
}

impl<T: 'static> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        self.close();
    }
}
