// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;

use crate::error::PrepareError;

/// Result of one preparation run. The failure is shared by every waiter
/// joined on the run.
pub(crate) type PrepResult<E> = Result<(), PrepareError<E>>;

pub(crate) type PrepFuture<E> = BoxFuture<'static, PrepResult<E>>;

type SharedPrep<E> = Shared<PrepFuture<E>>;

/// A single asynchronous run observed by any number of waiters.
///
/// Every waiter holds a strong [`Shared`] clone of the run; dropping that
/// clone is how a waiter abandons it. Unless the work is *pinned*, the
/// handle kept here is weak, so once the last waiter has dropped its clone
/// the inner future is dropped too and the run counts as cancelled. A
/// waiter leaving early never disturbs the clones the others still poll.
///
/// The final outcome is written into a shared cell by the wrapper future
/// immediately before the [`Shared`] resolves. That keeps success and
/// failure observable for late joiners even after every waiter has dropped
/// its clone, which a bare [`WeakShared`] cannot provide.
pub(crate) struct SharedWork<E> {
    handle: Handle<E>,
    outcome: Arc<Mutex<Option<PrepResult<E>>>>,
}

enum Handle<E> {
    /// The run lives exactly as long as somebody is waiting on it.
    Weak(WeakShared<PrepFuture<E>>),
    /// The run cannot be cancelled by waiter abandonment. Used for
    /// invalidation placeholders and release-time re-preparations, which
    /// have no caller of their own.
    Pinned(SharedPrep<E>),
}

/// How a run ended, as seen by whoever chains after it.
pub(crate) enum Settled<E> {
    Completed(PrepResult<E>),
    /// Every waiter abandoned the run before it finished; its future was
    /// dropped without producing an outcome.
    Cancelled,
}

impl<E> Clone for Settled<E> {
    fn clone(&self) -> Self {
        match self {
            Settled::Completed(result) => Settled::Completed(result.clone()),
            Settled::Cancelled => Settled::Cancelled,
        }
    }
}

impl<E: Send + Sync + 'static> SharedWork<E> {
    /// Wraps `inner` and begins tracking it.
    ///
    /// Returns the work handle together with the join observed by the
    /// initial waiter. For unpinned work that join is the only thing
    /// keeping the run alive, so dropping it before completion cancels
    /// the run.
    pub(crate) fn new(inner: PrepFuture<E>, pin: bool) -> (Self, Join<E>) {
        let outcome = Arc::new(Mutex::new(None));
        let cell = Arc::clone(&outcome);
        let wrapped: PrepFuture<E> = Box::pin(async move {
            let out = inner.await;
            *cell.lock() = Some(out.clone());
            out
        });
        let shared = wrapped.shared();
        let handle = if pin {
            Handle::Pinned(shared.clone())
        } else {
            // The inner future cannot have been taken out of a Shared that
            // nothing has polled yet.
            Handle::Weak(shared.downgrade().expect("freshly created shared"))
        };

        (Self { handle, outcome }, Join::Shared(shared))
    }

    /// Registers a new waiter on the run.
    ///
    /// Returns `None` when the run was cancelled because every previous
    /// waiter abandoned it; pinned work always joins.
    pub(crate) fn try_join(&self) -> Option<Join<E>> {
        if let Some(out) = self.outcome.lock().clone() {
            return Some(Join::Ready(out));
        }
        match &self.handle {
            Handle::Pinned(shared) => Some(Join::Shared(shared.clone())),
            Handle::Weak(weak) => weak.upgrade().map(Join::Shared),
        }
    }

    /// Returns a future resolving once the run has settled, one way or the
    /// other.
    ///
    /// Holding the returned future pins the run, which is precisely what
    /// serializes a successor chained after it: the predecessor either
    /// runs to completion or has already been dropped, never both.
    pub(crate) fn observe(&self) -> Settle<E> {
        if let Some(out) = self.outcome.lock().clone() {
            return Settle::Ready(Settled::Completed(out));
        }
        match &self.handle {
            Handle::Pinned(shared) => Settle::Waiting(shared.clone()),
            Handle::Weak(weak) => match weak.upgrade() {
                Some(shared) => Settle::Waiting(shared),
                None => Settle::Ready(Settled::Cancelled),
            },
        }
    }

    pub(crate) fn has_completed(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub(crate) fn is_faulted(&self) -> bool {
        matches!(&*self.outcome.lock(), Some(Err(_)))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        !self.has_completed()
            && matches!(&self.handle, Handle::Weak(weak) if weak.upgrade().is_none())
    }
}

impl<E> Clone for SharedWork<E> {
    fn clone(&self) -> Self {
        let handle = match &self.handle {
            Handle::Weak(weak) => Handle::Weak(weak.clone()),
            Handle::Pinned(shared) => Handle::Pinned(shared.clone()),
        };
        Self {
            handle,
            outcome: Arc::clone(&self.outcome),
        }
    }
}

impl<E> fmt::Debug for SharedWork<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWork")
            .field(
                "pinned",
                &matches!(self.handle, Handle::Pinned(_)),
            )
            .field("completed", &self.outcome.lock().is_some())
            .finish()
    }
}

// === impl Join ===

/// One waiter's view of a [`SharedWork`] run.
///
/// Dropping a pending `Join` is how the waiter abandons the run.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) enum Join<E> {
    Ready(PrepResult<E>),
    Shared(SharedPrep<E>),
}

impl<E> Future for Join<E> {
    type Output = PrepResult<E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut *self {
            Join::Ready(out) => Poll::Ready(out.clone()),
            Join::Shared(shared) => Pin::new(shared).poll(cx),
        }
    }
}

impl<E> fmt::Debug for Join<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Join::Ready(_) => f.pad("Join::Ready"),
            Join::Shared(_) => f.pad("Join::Shared"),
        }
    }
}

// === impl Settle ===

/// Future returned from [`SharedWork::observe()`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) enum Settle<E> {
    Ready(Settled<E>),
    Waiting(SharedPrep<E>),
}

impl<E> Future for Settle<E> {
    type Output = Settled<E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut *self {
            Settle::Ready(settled) => Poll::Ready(settled.clone()),
            Settle::Waiting(shared) => Pin::new(shared).poll(cx).map(Settled::Completed),
        }
    }
}

impl<E> fmt::Debug for Settle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Settle::Ready(_) => f.pad("Settle::Ready"),
            Settle::Waiting(_) => f.pad("Settle::Waiting"),
        }
    }
}
