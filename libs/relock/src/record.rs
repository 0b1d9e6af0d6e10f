// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;

use crate::shared::{Join, PrepFuture, Settle, SharedWork};

/// The access pattern a resource was last prepared for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// No established fit for either access pattern; the resource must be
    /// (re-)prepared before use. Also the target of an invalidation
    /// placeholder record, whose run merely awaits its predecessor.
    Unknown,
    /// The last completed preparation targeted shared, concurrent access.
    Concurrent,
    /// The last completed preparation targeted exclusive access.
    Exclusive,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Unknown => f.pad("unknown"),
            Mode::Concurrent => f.pad("concurrent"),
            Mode::Exclusive => f.pad("exclusive"),
        }
    }
}

/// Per-resource bookkeeping entry: which shared run is currently associated
/// with the resource and which mode it produces.
///
/// There is at most one record per resource at any time; records are
/// replaced only while the lock's private mutex is held, and a replacement
/// is stored, with its new target mode, before the chained run can
/// execute, so joiners arriving in between already observe the new mode.
pub(crate) struct PreparationRecord<E> {
    target: Mode,
    work: SharedWork<E>,
}

impl<E: Send + Sync + 'static> PreparationRecord<E> {
    /// Creates a record around `inner` and returns it with the initial
    /// waiter's join. `pin` exempts the run from abandonment cancellation.
    pub(crate) fn start(target: Mode, inner: PrepFuture<E>, pin: bool) -> (Self, Join<E>) {
        let (work, join) = SharedWork::new(inner, pin);
        (Self { target, work }, join)
    }

    pub(crate) fn target(&self) -> Mode {
        self.target
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.work.is_faulted()
    }

    /// The run was cancelled after every waiter abandoned it.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.work.is_cancelled()
    }

    /// Registers another waiter on the record's run; `None` when the run
    /// was cancelled after every previous waiter abandoned it.
    pub(crate) fn try_join(&self) -> Option<Join<E>> {
        self.work.try_join()
    }

    /// Future resolving once the record's run has settled. Successor
    /// records chain through this to keep preparations for one resource
    /// totally ordered.
    pub(crate) fn observe(&self) -> Settle<E> {
        self.work.observe()
    }
}

impl<E> Clone for PreparationRecord<E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target,
            work: self.work.clone(),
        }
    }
}

impl<E> fmt::Debug for PreparationRecord<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparationRecord")
            .field("target", &self.target)
            .field("work", &self.work)
            .finish()
    }
}
