//! Manager discovery and the process-wide registry.
//!
//! Managers reach the registry two ways:
//!
//! - **Link time**: a manager crate submits a [`ManagerProvider`] with
//!   `inventory::submit!`. Depending on the crate is all it takes; the
//!   provider is found when the registry first resolves.
//! - **Runtime**: hosts that build managers from configuration call
//!   [`ManagerRegistry::register`] with an already-constructed manager.
//!
//! Resolution is cached. Concurrent first callers observe a single discovery
//! pass; [`ManagerRegistry::reload`] discards the cache so the next call
//! re-discovers. Setting `TASUKI_NO_CACHE=1` disables the cache entirely,
//! which makes every lookup re-run discovery (useful when providers come and
//! go in a test harness).
//!
//! A provider that fails or panics while constructing its manager is logged
//! and skipped; one broken provider never hides the others, and a process
//! with no providers at all simply has an empty registry.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::warn;

use crate::manager::RegisteredManager;
use crate::snapshot::ContextSnapshot;

/// Link-time registration record for one context manager.
///
/// Submitted by manager crates:
///
/// ```ignore
/// inventory::submit! {
///     ManagerProvider {
///         name: "correlation",
///         construct: || Ok(RegisteredManager::new(CorrelationManager)),
///     }
/// }
/// ```
pub struct ManagerProvider {
    /// Name used in discovery logs when construction fails.
    pub name: &'static str,
    /// Builds the manager. Runs once per discovery pass.
    pub construct: fn() -> anyhow::Result<RegisteredManager>,
}

inventory::collect!(ManagerProvider);

/// Ordered, cached set of context managers for this process.
pub struct ManagerRegistry {
    discover_linked: bool,
    runtime: RwLock<Vec<RegisteredManager>>,
    cache: RwLock<Option<Arc<[RegisteredManager]>>>,
}

impl ManagerRegistry {
    /// Registry backed by link-time submitted providers plus anything
    /// registered at runtime.
    pub fn new() -> Self {
        Self {
            discover_linked: true,
            runtime: RwLock::new(Vec::new()),
            cache: RwLock::new(None),
        }
    }

    /// Registry that ignores link-time providers entirely. Only managers
    /// passed to [`register`](Self::register) take part. Meant for embedding
    /// an isolated manager set, and for tests.
    pub fn empty() -> Self {
        Self { discover_linked: false, ..Self::new() }
    }

    /// The process-wide registry used by the crate-level convenience
    /// functions and by wrappers that are not given an explicit registry.
    pub fn global() -> &'static ManagerRegistry {
        static GLOBAL: OnceLock<ManagerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ManagerRegistry::new)
    }

    /// Add a manager at runtime and invalidate the cached set.
    ///
    /// Snapshots taken before this call are unaffected; they hold the
    /// manager set that was current when they were captured.
    pub fn register(&self, manager: RegisteredManager) {
        self.runtime.write().push(manager);
        *self.cache.write() = None;
    }

    /// Discard the cached manager set. The next lookup re-runs discovery.
    pub fn reload(&self) {
        *self.cache.write() = None;
    }

    /// The ordered manager set: prioritized managers first (lower value
    /// earlier), then unprioritized ones in discovery order.
    ///
    /// The returned sequence is shared and immutable. Every caller between
    /// two invalidations receives the same allocation.
    pub fn managers(&self) -> Arc<[RegisteredManager]> {
        if cache_disabled() {
            return self.resolve();
        }
        if let Some(cached) = self.cache.read().clone() {
            return cached;
        }
        // Re-check under the write lock so racing first callers trigger
        // exactly one discovery pass.
        let mut cache = self.cache.write();
        if let Some(cached) = cache.clone() {
            return cached;
        }
        let resolved = self.resolve();
        *cache = Some(resolved.clone());
        resolved
    }

    /// Capture the current thread's context across this registry's managers.
    pub fn capture_snapshot(&self) -> ContextSnapshot {
        ContextSnapshot::capture_from(self)
    }

    /// Invoke every manager's `clear_active` on the calling thread.
    ///
    /// Pool hygiene between tasks: a reused worker thread starts with no
    /// inherited context. Panics are contained per manager.
    pub fn clear_active_contexts(&self) {
        for manager in self.managers().iter() {
            if catch_unwind(AssertUnwindSafe(|| manager.clear_active())).is_err() {
                warn!(manager = manager.name(), "clear_active panicked");
            }
        }
    }

    fn resolve(&self) -> Arc<[RegisteredManager]> {
        let mut managers: Vec<RegisteredManager> = Vec::new();
        if self.discover_linked {
            for provider in inventory::iter::<ManagerProvider> {
                match catch_unwind(AssertUnwindSafe(|| (provider.construct)())) {
                    Ok(Ok(manager)) => managers.push(manager),
                    Ok(Err(error)) => {
                        warn!(
                            provider = provider.name,
                            error = %error,
                            "context manager provider failed, skipping"
                        );
                    }
                    Err(_) => {
                        warn!(
                            provider = provider.name,
                            "context manager provider panicked, skipping"
                        );
                    }
                }
            }
        }
        managers.extend(self.runtime.read().iter().cloned());
        // Stable sort: unprioritized managers keep their discovery order.
        managers.sort_by_key(|manager| match manager.priority() {
            Some(priority) => (0_i8, priority),
            None => (1_i8, 0),
        });
        if managers.is_empty() { empty_set() } else { Arc::from(managers) }
    }
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One shared allocation for "no managers", reused across reloads.
fn empty_set() -> Arc<[RegisteredManager]> {
    static EMPTY: OnceLock<Arc<[RegisteredManager]>> = OnceLock::new();
    EMPTY.get_or_init(|| Arc::from(Vec::new())).clone()
}

fn cache_disabled() -> bool {
    std::env::var("TASUKI_NO_CACHE")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
