// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::task::Waker;

use bitflags::bitflags;
use futures::future::BoxFuture;

bitflags! {
    /// Options for an upgradeable-read or write acquisition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u8 {
        /// Exclusivity gained by a write nested inside this upgradeable
        /// read is retained by the upgradeable read after the write
        /// releases, until the upgradeable read itself releases.
        const STICKY_WRITE = 1 << 0;
        /// Forwarded to `prepare_exclusive` through the aggregate flags;
        /// never interpreted by the lock itself.
        const SKIP_INITIAL_PREPARATION = 1 << 1;
    }
}

/// Post-release work parked on the lock.
///
/// Releasing the outermost write performs the synchronous half of the
/// release processing immediately and parks the asynchronous half here.
/// Whichever waiter next needs the lock takes the future out, drives it to
/// completion and only then proceeds, so no acquisition ever observes the
/// post-release state with the processing still outstanding.
pub(crate) enum ReleaseWork {
    Idle,
    Parked(BoxFuture<'static, ()>),
    /// A driver has taken the future out and is polling it; everyone else
    /// waits to be woken.
    Driving,
}

/// Bookkeeping for the three-mode reader/writer lock.
///
/// This is a pure state machine: it lives under the lock's single private
/// mutex and never blocks, never wakes and never runs user code on its
/// own. All mode counts are re-entrancy counts.
pub(crate) struct LockBook {
    readers: usize,
    upgradeable: usize,
    writers: usize,
    /// A sticky upgradeable read is holding on to the exclusivity of a
    /// nested write that has already released.
    sticky_engaged: bool,
    /// Flags of the active upgradeable-read and write acquisitions, in
    /// acquisition order. Guard nesting is enforced by borrows, so pushes
    /// and pops pair up LIFO.
    flag_stack: Vec<LockFlags>,
    waiters: Vec<Waker>,
    release: ReleaseWork,
}

impl LockBook {
    pub(crate) fn new() -> Self {
        Self {
            readers: 0,
            upgradeable: 0,
            writers: 0,
            sticky_engaged: false,
            flag_stack: Vec::new(),
            waiters: Vec::new(),
            release: ReleaseWork::Idle,
        }
    }

    pub(crate) fn is_read_locked(&self) -> bool {
        self.readers > 0
    }

    pub(crate) fn is_upgradeable_read_locked(&self) -> bool {
        self.upgradeable > 0
    }

    /// A sticky upgradeable read that outlived its nested write still
    /// counts as holding the write.
    pub(crate) fn is_write_locked(&self) -> bool {
        self.writers > 0 || self.sticky_engaged
    }

    /// Bitwise union of the flags of every active acquisition.
    pub(crate) fn aggregate_flags(&self) -> LockFlags {
        self.flag_stack
            .iter()
            .fold(LockFlags::empty(), |acc, flags| acc | *flags)
    }

    // Admission rules. New top-level entrants are kept out while any
    // exclusivity is live; re-entrant acquisitions only ever come from the
    // lineage that already holds the conflicting mode, so they pass.

    pub(crate) fn may_read(&self) -> bool {
        !self.is_write_locked()
    }

    pub(crate) fn may_upgradeable_read(&self) -> bool {
        self.upgradeable == 0 && !self.is_write_locked()
    }

    pub(crate) fn may_write(&self) -> bool {
        self.readers == 0 && self.upgradeable == 0 && !self.is_write_locked()
    }

    /// Upgrade from the (sole) upgradeable-read holder: every plain reader
    /// must have drained first.
    pub(crate) fn may_upgrade(&self) -> bool {
        self.readers == 0 && self.writers == 0
    }

    pub(crate) fn grant_read(&mut self) {
        self.readers += 1;
    }

    pub(crate) fn grant_upgradeable_read(&mut self, flags: LockFlags) {
        self.upgradeable += 1;
        self.flag_stack.push(flags);
    }

    pub(crate) fn grant_write(&mut self, flags: LockFlags) {
        self.writers += 1;
        self.flag_stack.push(flags);
    }

    pub(crate) fn release_read(&mut self) {
        debug_assert!(self.readers > 0);
        self.readers -= 1;
    }

    /// Returns `true` when this released the outermost upgradeable read.
    pub(crate) fn release_upgradeable_read(&mut self) -> bool {
        debug_assert!(self.upgradeable > 0);
        self.upgradeable -= 1;
        self.flag_stack.pop();
        self.upgradeable == 0
    }

    /// Records the release of one write acquisition and classifies it.
    ///
    /// When the surrounding upgradeable read was acquired sticky, the
    /// exclusivity is retained instead of released and the caller must not
    /// run the exclusive-release processing yet.
    pub(crate) fn release_write(&mut self) -> WriteReleased {
        debug_assert!(self.writers > 0);
        self.writers -= 1;
        self.flag_stack.pop();
        if self.writers > 0 {
            return WriteReleased::StillHeld;
        }
        if self.upgradeable > 0 && self.aggregate_flags().contains(LockFlags::STICKY_WRITE) {
            self.sticky_engaged = true;
            tracing::trace!("write released into sticky upgradeable read");
            return WriteReleased::Sticky;
        }
        WriteReleased::Outermost
    }

    /// Drops retained sticky exclusivity; returns whether any was held.
    pub(crate) fn disengage_sticky(&mut self) -> bool {
        std::mem::replace(&mut self.sticky_engaged, false)
    }

    pub(crate) fn park_release_work(&mut self, work: BoxFuture<'static, ()>) {
        debug_assert!(matches!(self.release, ReleaseWork::Idle));
        self.release = ReleaseWork::Parked(work);
    }

    /// Claims parked release work for the calling driver.
    pub(crate) fn claim_release_work(&mut self) -> Option<BoxFuture<'static, ()>> {
        if !matches!(self.release, ReleaseWork::Parked(_)) {
            return None;
        }
        let ReleaseWork::Parked(work) = std::mem::replace(&mut self.release, ReleaseWork::Driving)
        else {
            unreachable!()
        };
        Some(work)
    }

    /// A claimed driver gave up; hand the work to the next waiter.
    pub(crate) fn repark_release_work(&mut self, work: BoxFuture<'static, ()>) {
        debug_assert!(matches!(self.release, ReleaseWork::Driving));
        self.release = ReleaseWork::Parked(work);
    }

    /// Release processing is parked or being driven; acquisitions must not
    /// proceed yet.
    pub(crate) fn release_work_pending(&self) -> bool {
        !matches!(self.release, ReleaseWork::Idle)
    }

    pub(crate) fn finish_release_work(&mut self) {
        debug_assert!(matches!(self.release, ReleaseWork::Driving));
        self.release = ReleaseWork::Idle;
    }

    pub(crate) fn register_waker(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|held| held.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteReleased {
    /// An enclosing write is still active.
    StillHeld,
    /// The outermost write released into a sticky upgradeable read; the
    /// exclusivity lives on.
    Sticky,
    /// The outermost write released; run the exclusive-release processing.
    Outermost,
}

impl fmt::Debug for LockBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockBook")
            .field("readers", &self.readers)
            .field("upgradeable", &self.upgradeable)
            .field("writers", &self.writers)
            .field("sticky_engaged", &self.sticky_engaged)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

impl fmt::Debug for ReleaseWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseWork::Idle => f.pad("Idle"),
            ReleaseWork::Parked(_) => f.pad("Parked"),
            ReleaseWork::Driving => f.pad("Driving"),
        }
    }
}
