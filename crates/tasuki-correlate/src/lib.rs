//! Correlation-ID propagation across task handoff.
//!
//! Each thread carries one [`CorrelationMap`], a small ordered string map in
//! the manner of a mapped diagnostic context: request IDs, tenant names,
//! anything worth stamping on every log line of a flow. The static functions
//! ([`put`], [`get`], [`put_scoped`], ...) edit the calling thread's map in
//! place.
//!
//! Depending on this crate is all it takes to make the map travel:
//! [`CorrelationManager`] registers itself with the `tasuki-core` registry at
//! link time, so every snapshot captures the submitting thread's map and
//! every context-aware executor, wrapper, and future reproduces it on the
//! executing thread.
//!
//! ```ignore
//! use tasuki_core::ContextAwareExecutor;
//!
//! tasuki_correlate::put("request.id", tasuki_correlate::fresh_id());
//!
//! let executor = ContextAwareExecutor::new(pool);
//! executor.execute(Box::new(|| {
//!     // request.id is present here, on whichever thread runs this
//! }));
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tasuki_core::{ActiveContext, ContextManager, ManagerProvider, RegisteredManager};
use uuid::Uuid;

// ============================================================================
// The map
// ============================================================================

/// Ordered key/value correlation data for one thread.
///
/// Serializes as a plain JSON object, so it can be embedded directly in
/// structured log payloads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationMap {
    entries: BTreeMap<String, String>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl fmt::Display for CorrelationMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, (key, value)) in self.entries.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, String)> for CorrelationMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

// ============================================================================
// Thread-bound static API
// ============================================================================

thread_local! {
    static ACTIVE: RefCell<CorrelationMap> = RefCell::new(CorrelationMap::new());
}

/// Set `key` on the calling thread's map. Returns the replaced value.
pub fn put(key: impl Into<String>, value: impl Into<String>) -> Option<String> {
    ACTIVE.with(|map| map.borrow_mut().insert(key, value))
}

/// Read `key` from the calling thread's map.
pub fn get(key: &str) -> Option<String> {
    ACTIVE.with(|map| map.borrow().get(key).map(str::to_string))
}

/// Remove `key` from the calling thread's map. Returns the removed value.
pub fn remove(key: &str) -> Option<String> {
    ACTIVE.with(|map| map.borrow_mut().remove(key))
}

/// Wipe the calling thread's map.
pub fn clear() {
    ACTIVE.with(|map| map.borrow_mut().entries.clear());
}

/// A copy of the calling thread's map.
pub fn copy_of_map() -> CorrelationMap {
    ACTIVE.with(|map| map.borrow().clone())
}

/// Whether the calling thread's map has no entries.
pub fn is_empty() -> bool {
    ACTIVE.with(|map| map.borrow().is_empty())
}

/// Set `key` until the returned guard closes, then restore the key's
/// previous state (its old value, or absence).
pub fn put_scoped(key: impl Into<String>, value: impl Into<String>) -> CorrelationGuard {
    let key = key.into();
    let previous = put(key.clone(), value);
    CorrelationGuard { key, previous, closed: false, _not_send: PhantomData }
}

/// A fresh time-ordered correlation ID, 32 hex characters.
pub fn fresh_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Restores one key of the calling thread's map when closed or dropped.
pub struct CorrelationGuard {
    key: String,
    previous: Option<String>,
    closed: bool,
    // Thread-bound: closing elsewhere would edit another thread's map.
    _not_send: PhantomData<*const ()>,
}

impl CorrelationGuard {
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let key = std::mem::take(&mut self.key);
        let previous = self.previous.take();
        // try_with: the guard may drop during thread teardown.
        let _ = ACTIVE.try_with(|map| {
            let mut map = map.borrow_mut();
            match previous {
                Some(value) => map.insert(key, value),
                None => map.remove(&key),
            }
        });
    }
}

impl Drop for CorrelationGuard {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// The manager
// ============================================================================

/// Propagates the thread's correlation map through context snapshots.
///
/// An empty map captures as absent: there is nothing to propagate, and the
/// executing thread's own (empty) map is left untouched. The manager owns
/// its storage, so it takes part in pool hygiene via `clear_active`.
#[derive(Debug, Default)]
pub struct CorrelationManager;

impl ContextManager for CorrelationManager {
    type Value = CorrelationMap;

    fn name(&self) -> &'static str {
        "correlation"
    }

    fn active_value(&self) -> Option<CorrelationMap> {
        let map = copy_of_map();
        if map.is_empty() { None } else { Some(map) }
    }

    fn activate(&self, value: CorrelationMap) -> Box<dyn ActiveContext> {
        let previous = ACTIVE.with(|map| map.replace(value));
        Box::new(ActiveCorrelation { previous: Some(previous), closed: false })
    }

    fn clear_active(&self) {
        clear();
    }
}

struct ActiveCorrelation {
    previous: Option<CorrelationMap>,
    closed: bool,
}

impl ActiveContext for ActiveCorrelation {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(previous) = self.previous.take() {
            let _ = ACTIVE.try_with(|map| map.replace(previous));
        }
    }
}

impl Drop for ActiveCorrelation {
    fn drop(&mut self) {
        self.close();
    }
}

inventory::submit! {
    ManagerProvider {
        name: "correlation",
        construct: || Ok(RegisteredManager::new(CorrelationManager)),
    }
}
