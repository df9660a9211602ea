//! Closure wrappers that run their delegate under a context snapshot.
//!
//! Every wrapper follows the same bracket for every invocation:
//!
//! 1. resolve the snapshot (a fixed one, or fresh from a supplier),
//! 2. reactivate it on the current thread,
//! 3. hand the snapshot to the observer callback, if one is attached,
//! 4. run the delegate with the original arguments,
//! 5. close the reactivation, on every exit path.
//!
//! A delegate panic propagates unchanged after the contexts are restored.
//! Close failures are logged by the snapshot layer and never mask the
//! delegate's outcome.
//!
//! The predicate combinators compose into a single delegate, so `a.and(b)`
//! evaluates the whole boolean expression inside one reactivate/close
//! bracket, and short-circuiting means `b` may never run at all.

use std::marker::PhantomData;

use crate::error::ContextError;
use crate::snapshot::ContextSnapshot;

/// Observer invoked with the resolved snapshot on every wrapped call, after
/// reactivation and before the delegate.
pub type SnapshotConsumer = Box<dyn FnMut(&ContextSnapshot) + Send>;

// ============================================================================
// Snapshot source
// ============================================================================

/// Where a wrapper gets its snapshot: captured once up front, or supplied
/// fresh at every invocation.
pub struct SnapshotSource {
    kind: SourceKind,
}

enum SourceKind {
    Fixed(ContextSnapshot),
    Supplied(Box<dyn Fn() -> ContextSnapshot + Send + Sync>),
}

impl SnapshotSource {
    pub fn fixed(snapshot: ContextSnapshot) -> Self {
        Self { kind: SourceKind::Fixed(snapshot) }
    }

    pub fn supplied(supply: impl Fn() -> ContextSnapshot + Send + Sync + 'static) -> Self {
        Self { kind: SourceKind::Supplied(Box::new(supply)) }
    }

    /// Build a source from optional parts, for hosts that assemble wrappers
    /// from configuration. Fails when neither part is present; a fixed
    /// snapshot takes precedence when both are.
    ///
    /// This is the one configuration error in the crate, and it surfaces at
    /// construction time, never at invocation time.
    pub fn from_parts(
        snapshot: Option<ContextSnapshot>,
        supplier: Option<Box<dyn Fn() -> ContextSnapshot + Send + Sync>>,
    ) -> crate::Result<Self> {
        match (snapshot, supplier) {
            (Some(snapshot), _) => Ok(Self::fixed(snapshot)),
            (None, Some(supply)) => Ok(Self { kind: SourceKind::Supplied(supply) }),
            (None, None) => Err(ContextError::MissingSnapshot),
        }
    }

    fn resolve(&self) -> ContextSnapshot {
        match &self.kind {
            SourceKind::Fixed(snapshot) => snapshot.clone(),
            SourceKind::Supplied(supply) => supply(),
        }
    }
}

impl std::fmt::Debug for SnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SourceKind::Fixed(snapshot) => f.debug_tuple("Fixed").field(snapshot).finish(),
            SourceKind::Supplied(_) => f.debug_tuple("Supplied").finish(),
        }
    }
}

/// The shared invocation bracket. Reactivation is closed on the normal path
/// explicitly and on the panic path by the composite's drop.
fn around<R>(
    source: &SnapshotSource,
    consumer: &mut Option<SnapshotConsumer>,
    run: impl FnOnce() -> R,
) -> R {
    let snapshot = source.resolve();
    let mut active = snapshot.reactivate();
    if let Some(consumer) = consumer.as_mut() {
        consumer(&snapshot);
    }
    let result = run();
    active.close();
    result
}

// ============================================================================
// Plain closure wrappers
// ============================================================================

/// Zero-argument delegate run under a snapshot.
pub struct CallWithContext<F> {
    source: SnapshotSource,
    consumer: Option<SnapshotConsumer>,
    delegate: F,
}

impl<F> CallWithContext<F> {
    pub fn new(snapshot: ContextSnapshot, delegate: F) -> Self {
        Self::from_source(SnapshotSource::fixed(snapshot), delegate)
    }

    pub fn from_source(source: SnapshotSource, delegate: F) -> Self {
        Self { source, consumer: None, delegate }
    }

    /// Attach an observer for the resolved snapshot. It runs once per call,
    /// after reactivation, before the delegate.
    pub fn with_consumer(
        mut self,
        consumer: impl FnMut(&ContextSnapshot) + Send + 'static,
    ) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    pub fn call<R>(&mut self) -> R
    where
        F: FnMut() -> R,
    {
        let Self { source, consumer, delegate } = self;
        around(source, consumer, || delegate())
    }
}

/// One-argument delegate run under a snapshot.
pub struct FnWithContext<F> {
    source: SnapshotSource,
    consumer: Option<SnapshotConsumer>,
    delegate: F,
}

impl<F> FnWithContext<F> {
    pub fn new(snapshot: ContextSnapshot, delegate: F) -> Self {
        Self::from_source(SnapshotSource::fixed(snapshot), delegate)
    }

    pub fn from_source(source: SnapshotSource, delegate: F) -> Self {
        Self { source, consumer: None, delegate }
    }

    pub fn with_consumer(
        mut self,
        consumer: impl FnMut(&ContextSnapshot) + Send + 'static,
    ) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    pub fn apply<A, R>(&mut self, input: A) -> R
    where
        F: FnMut(A) -> R,
    {
        let Self { source, consumer, delegate } = self;
        around(source, consumer, move || delegate(input))
    }
}

/// Two-argument delegate run under a snapshot.
pub struct BiFnWithContext<F> {
    source: SnapshotSource,
    consumer: Option<SnapshotConsumer>,
    delegate: F,
}

impl<F> BiFnWithContext<F> {
    pub fn new(snapshot: ContextSnapshot, delegate: F) -> Self {
        Self::from_source(SnapshotSource::fixed(snapshot), delegate)
    }

    pub fn from_source(source: SnapshotSource, delegate: F) -> Self {
        Self { source, consumer: None, delegate }
    }

    pub fn with_consumer(
        mut self,
        consumer: impl FnMut(&ContextSnapshot) + Send + 'static,
    ) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    pub fn apply<A, B, R>(&mut self, first: A, second: B) -> R
    where
        F: FnMut(A, B) -> R,
    {
        let Self { source, consumer, delegate } = self;
        around(source, consumer, move || delegate(first, second))
    }
}

// ============================================================================
// Predicates
// ============================================================================

/// Boolean test run under a snapshot, with combinators that keep the whole
/// composed expression inside one reactivate/close bracket.
pub struct PredicateWithContext<T, F> {
    source: SnapshotSource,
    consumer: Option<SnapshotConsumer>,
    predicate: F,
    _input: PhantomData<fn(&T) -> bool>,
}

impl<T, F> PredicateWithContext<T, F>
where
    F: FnMut(&T) -> bool,
{
    pub fn new(snapshot: ContextSnapshot, predicate: F) -> Self {
        Self::from_source(SnapshotSource::fixed(snapshot), predicate)
    }

    pub fn from_source(source: SnapshotSource, predicate: F) -> Self {
        Self { source, consumer: None, predicate, _input: PhantomData }
    }

    pub fn with_consumer(
        mut self,
        consumer: impl FnMut(&ContextSnapshot) + Send + 'static,
    ) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    pub fn test(&mut self, input: &T) -> bool {
        let Self { source, consumer, predicate, .. } = self;
        around(source, consumer, || predicate(input))
    }

    /// Logical AND. Short-circuits: when this predicate is false, `other`
    /// never runs. Either way there is exactly one reactivation.
    pub fn and<G>(self, mut other: G) -> PredicateWithContext<T, impl FnMut(&T) -> bool>
    where
        G: FnMut(&T) -> bool,
    {
        let mut first = self.predicate;
        PredicateWithContext {
            source: self.source,
            consumer: self.consumer,
            predicate: move |input: &T| first(input) && other(input),
            _input: PhantomData,
        }
    }

    /// Logical OR. Short-circuits: when this predicate is true, `other`
    /// never runs.
    pub fn or<G>(self, mut other: G) -> PredicateWithContext<T, impl FnMut(&T) -> bool>
    where
        G: FnMut(&T) -> bool,
    {
        let mut first = self.predicate;
        PredicateWithContext {
            source: self.source,
            consumer: self.consumer,
            predicate: move |input: &T| first(input) || other(input),
            _input: PhantomData,
        }
    }

    pub fn negate(self) -> PredicateWithContext<T, impl FnMut(&T) -> bool> {
        let mut inner = self.predicate;
        PredicateWithContext {
            source: self.source,
            consumer: self.consumer,
            predicate: move |input: &T| !inner(input),
            _input: PhantomData,
        }
    }
}

/// Two-argument boolean test run under a snapshot.
pub struct BiPredicateWithContext<A, B, F> {
    source: SnapshotSource,
    consumer: Option<SnapshotConsumer>,
    predicate: F,
    _input: PhantomData<fn(&A, &B) -> bool>,
}

impl<A, B, F> BiPredicateWithContext<A, B, F>
where
    F: FnMut(&A, &B) -> bool,
{
    pub fn new(snapshot: ContextSnapshot, predicate: F) -> Self {
        Self::from_source(SnapshotSource::fixed(snapshot), predicate)
    }

    pub fn from_source(source: SnapshotSource, predicate: F) -> Self {
        Self { source, consumer: None, predicate, _input: PhantomData }
    }

    pub fn with_consumer(
        mut self,
        consumer: impl FnMut(&ContextSnapshot) + Send + 'static,
    ) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    pub fn test(&mut self, first: &A, second: &B) -> bool {
        let Self { source, consumer, predicate, .. } = self;
        around(source, consumer, || predicate(first, second))
    }

    pub fn and<G>(self, mut other: G) -> BiPredicateWithContext<A, B, impl FnMut(&A, &B) -> bool>
    where
        G: FnMut(&A, &B) -> bool,
    {
        let mut first = self.predicate;
        BiPredicateWithContext {
            source: self.source,
            consumer: self.consumer,
            predicate: move |a: &A, b: &B| first(a, b) && other(a, b),
            _input: PhantomData,
        }
    }

    pub fn or<G>(self, mut other: G) -> BiPredicateWithContext<A, B, impl FnMut(&A, &B) -> bool>
    where
        G: FnMut(&A, &B) -> bool,
    {
        let mut first = self.predicate;
        BiPredicateWithContext {
            source: self.source,
            consumer: self.consumer,
            predicate: move |a: &A, b: &B| first(a, b) || other(a, b),
            _input: PhantomData,
        }
    }

    pub fn negate(self) -> BiPredicateWithContext<A, B, impl FnMut(&A, &B) -> bool> {
        let mut inner = self.predicate;
        BiPredicateWithContext {
            source: self.source,
            consumer: self.consumer,
            predicate: move |a: &A, b: &B| !inner(a, b),
            _input: PhantomData,
        }
    }
}
