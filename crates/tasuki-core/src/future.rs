//! Context propagation for futures.
//!
//! A future may be polled from any worker thread of a runtime. Wrapping it
//! in [`WithContextFuture`] reactivates a snapshot around every poll and
//! restores the polling thread before the poll returns, so the future's code
//! always observes the captured context and the runtime's threads never
//! keep it between polls.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::snapshot::ContextSnapshot;

pin_project! {
    /// Future that runs every poll under a context snapshot.
    #[must_use = "futures do nothing unless polled"]
    pub struct WithContextFuture<F> {
        #[pin]
        inner: F,
        snapshot: ContextSnapshot,
    }
}

impl<F: Future> Future for WithContextFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut active = this.snapshot.reactivate();
        let result = this.inner.poll(cx);
        active.close();
        result
    }
}

/// Extension methods that attach a context snapshot to any future.
pub trait FutureExt: Future + Sized {
    /// Run every poll under `snapshot`.
    fn with_context(self, snapshot: ContextSnapshot) -> WithContextFuture<Self> {
        WithContextFuture { inner: self, snapshot }
    }

    /// Capture the calling thread's context now and run every poll under it.
    fn with_current_context(self) -> WithContextFuture<Self> {
        self.with_context(ContextSnapshot::capture())
    }
}

impl<F: Future> FutureExt for F {}
