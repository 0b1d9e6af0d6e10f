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

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::book::{LockBook, LockFlags, WriteReleased};
use crate::error::ResourceError;
use crate::provider::ResourceProvider;
use crate::tables::ResourceTables;

/// An asynchronous reader/writer lock that also manages the *state* of the
/// resources accessed under it.
///
/// The lock has three re-entrant modes (read, upgradeable read and write)
/// and guards more than the critical section: resources obtained through
/// [`get_resource`][ReadGuard::get_resource] are transitioned into a state
/// fit for the caller's lock mode by the [`ResourceProvider`] before the
/// caller sees them. Each such preparation runs at most once per mode
/// transition and is shared by every concurrent waiter.
///
/// Releasing the outermost write invalidates every prepared resource, and
/// resources touched under a still-held upgradeable read are re-prepared
/// for concurrent access before the lock admits anyone else.
pub struct ResourceLock<P: ResourceProvider> {
    provider: Arc<P>,
    /// The lock's single private mutex. It guards the mode bookkeeping,
    /// the preparation table and the upgradeable-read-accessed set; no
    /// provider code runs and nothing is awaited while it is held.
    state: Mutex<State<P>>,
}

struct State<P: ResourceProvider> {
    book: LockBook,
    tables: ResourceTables<P>,
}

impl<P: ResourceProvider> ResourceLock<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            state: Mutex::new(State {
                book: LockBook::new(),
                tables: ResourceTables::new(),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Acquires a read lock.
    pub async fn read(&self) -> ReadGuard<'_, P> {
        self.acquire(AcquireKind::Read).await;
        ReadGuard { lock: self }
    }

    /// Acquires an upgradeable read lock: shared with plain readers, but
    /// able to [nest a write][UpgradeableReadGuard::write].
    pub async fn upgradeable_read(&self, flags: LockFlags) -> UpgradeableReadGuard<'_, P> {
        self.acquire(AcquireKind::UpgradeableRead(flags)).await;
        UpgradeableReadGuard { lock: self }
    }

    /// Acquires a write lock.
    pub async fn write(&self, flags: LockFlags) -> WriteGuard<'_, P> {
        self.acquire(AcquireKind::Write(flags)).await;
        WriteGuard { lock: self }
    }

    pub fn is_read_locked(&self) -> bool {
        self.state.lock().book.is_read_locked()
    }

    pub fn is_upgradeable_read_locked(&self) -> bool {
        self.state.lock().book.is_upgradeable_read_locked()
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().book.is_write_locked()
    }

    /// Bitwise union of the flags of every lock currently held.
    pub fn aggregate_lock_flags(&self) -> LockFlags {
        self.state.lock().book.aggregate_flags()
    }

    fn acquire(&self, kind: AcquireKind) -> Acquire<'_, P> {
        Acquire {
            lock: self,
            kind,
            driving: None,
        }
    }

    /// Completes any parked post-release processing before returning.
    async fn drive_release_work(&self) {
        self.acquire(AcquireKind::Drive).await;
    }

    async fn get_resource_inner(
        &self,
        moniker: &P::Moniker,
    ) -> Result<Arc<P::Resource>, ResourceError<P::Error>> {
        self.drive_release_work().await;
        let resource = self
            .provider
            .fetch(moniker)
            .await
            .map_err(ResourceError::Fetch)?;
        let join = {
            let mut state = self.state.lock();
            let State { book, tables } = &mut *state;
            tables.mark_accessed(book, &resource);
            tables.prepare(&resource, false, book, &self.provider)
        };
        join.await.map_err(ResourceError::Prepare)?;
        Ok(resource)
    }

    fn mark_accessed_inner(&self, resource: &Arc<P::Resource>) {
        let mut state = self.state.lock();
        let State { book, tables } = &mut *state;
        tables.mark_accessed(book, resource);
    }

    fn mark_accessed_matching_inner<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&Arc<P::Resource>) -> bool,
    {
        // Snapshot first; the predicate is caller code and must not run
        // under the private mutex.
        let snapshot = self.state.lock().tables.snapshot_resources();
        let matched: Vec<_> = snapshot
            .into_iter()
            .filter(|resource| predicate(resource))
            .collect();
        if matched.is_empty() {
            return false;
        }
        let mut state = self.state.lock();
        let State { book, tables } = &mut *state;
        for resource in &matched {
            tables.mark_accessed(book, resource);
        }
        true
    }
}

#[cfg(test)]
impl<P: ResourceProvider> ResourceLock<P> {
    pub(crate) fn record_target(&self, resource: &Arc<P::Resource>) -> Option<crate::record::Mode> {
        self.state.lock().tables.record_target(resource)
    }

    pub(crate) fn record_count(&self) -> usize {
        self.state.lock().tables.record_count()
    }

    pub(crate) fn accessed_count(&self) -> usize {
        self.state.lock().tables.accessed_count()
    }
}

impl<P: ResourceProvider> fmt::Debug for ResourceLock<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ResourceLock");
        match self.state.try_lock() {
            Some(state) => d.field("book", &state.book),
            // Additional format_args! here is to remove quotes around <locked> in debug output.
            None => d.field("book", &format_args!("<locked>")),
        };
        d.finish()
    }
}

#[derive(Clone, Copy)]
enum AcquireKind {
    Read,
    UpgradeableRead(LockFlags),
    Write(LockFlags),
    /// Write nested in the (sole) upgradeable read; waits for plain
    /// readers to drain.
    Upgrade(LockFlags),
    /// Re-entrant acquisitions only ever come from the lineage already
    /// holding the conflicting mode, so they are admitted immediately.
    NestedRead,
    NestedUpgradeableRead(LockFlags),
    NestedWrite(LockFlags),
    /// Acquires nothing; completes once no release processing is pending.
    Drive,
}

/// Future of one acquisition.
///
/// Before anything is granted, parked post-release processing is driven to
/// completion by whichever waiter gets to it first; everyone else waits to
/// be woken. This is what orders "write released" strictly before "next
/// lock observed".
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
struct Acquire<'a, P: ResourceProvider> {
    lock: &'a ResourceLock<P>,
    kind: AcquireKind,
    driving: Option<BoxFuture<'static, ()>>,
}

impl<P: ResourceProvider> Future for Acquire<'_, P> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(work) = this.driving.as_mut() {
                match work.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.driving = None;
                        let mut state = this.lock.state.lock();
                        state.book.finish_release_work();
                        state.book.wake_all();
                        continue;
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            let mut state = this.lock.state.lock();
            if let Some(work) = state.book.claim_release_work() {
                drop(state);
                this.driving = Some(work);
                continue;
            }
            if state.book.release_work_pending() {
                // Another waiter is driving; wait to be woken.
                state.book.register_waker(cx.waker());
                return Poll::Pending;
            }

            let book = &mut state.book;
            let granted = match this.kind {
                AcquireKind::Drive => true,
                AcquireKind::Read if book.may_read() => {
                    book.grant_read();
                    true
                }
                AcquireKind::NestedRead => {
                    book.grant_read();
                    true
                }
                AcquireKind::UpgradeableRead(flags) if book.may_upgradeable_read() => {
                    book.grant_upgradeable_read(flags);
                    true
                }
                AcquireKind::NestedUpgradeableRead(flags) => {
                    book.grant_upgradeable_read(flags);
                    true
                }
                AcquireKind::Write(flags) if book.may_write() => {
                    book.grant_write(flags);
                    true
                }
                AcquireKind::Upgrade(flags) if book.may_upgrade() => {
                    book.grant_write(flags);
                    true
                }
                AcquireKind::NestedWrite(flags) => {
                    book.grant_write(flags);
                    true
                }
                _ => false,
            };
            if granted {
                return Poll::Ready(());
            }
            book.register_waker(cx.waker());
            return Poll::Pending;
        }
    }
}

impl<P: ResourceProvider> Drop for Acquire<'_, P> {
    fn drop(&mut self) {
        // A dropped driver hands the release work back so the next waiter
        // can finish it.
        if let Some(work) = self.driving.take() {
            let mut state = self.lock.state.lock();
            state.book.repark_release_work(work);
            state.book.wake_all();
        }
    }
}

// === impl ReadGuard ===

/// Releases the shared read access when dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct ReadGuard<'a, P: ResourceProvider> {
    lock: &'a ResourceLock<P>,
}

impl<P: ResourceProvider> ReadGuard<'_, P> {
    /// Re-entrant read acquisition.
    pub async fn read(&self) -> ReadGuard<'_, P> {
        self.lock.acquire(AcquireKind::NestedRead).await;
        ReadGuard { lock: self.lock }
    }

    /// Fetches the resource identified by `moniker`, prepared for the
    /// caller's lock mode.
    pub async fn get_resource(
        &self,
        moniker: &P::Moniker,
    ) -> Result<Arc<P::Resource>, ResourceError<P::Error>> {
        self.lock.get_resource_inner(moniker).await
    }

    /// Explicitly tags `resource` as touched under the current upgradeable
    /// read. No-op outside one.
    pub fn mark_accessed(&self, resource: &Arc<P::Resource>) {
        self.lock.mark_accessed_inner(resource);
    }

    /// Releases the lock; completes when any release processing has too.
    pub async fn release(self) {
        let lock = self.lock;
        drop(self);
        lock.drive_release_work().await;
    }
}

impl<P: ResourceProvider> Drop for ReadGuard<'_, P> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.book.release_read();
        state.book.wake_all();
    }
}

impl<P: ResourceProvider> fmt::Debug for ReadGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ReadGuard")
    }
}

// === impl UpgradeableReadGuard ===

/// Releases the upgradeable read access when dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct UpgradeableReadGuard<'a, P: ResourceProvider> {
    lock: &'a ResourceLock<P>,
}

impl<P: ResourceProvider> UpgradeableReadGuard<'_, P> {
    /// Re-entrant read acquisition.
    pub async fn read(&self) -> ReadGuard<'_, P> {
        self.lock.acquire(AcquireKind::NestedRead).await;
        ReadGuard { lock: self.lock }
    }

    /// Re-entrant upgradeable read acquisition.
    pub async fn upgradeable_read(&self, flags: LockFlags) -> UpgradeableReadGuard<'_, P> {
        self.lock
            .acquire(AcquireKind::NestedUpgradeableRead(flags))
            .await;
        UpgradeableReadGuard { lock: self.lock }
    }

    /// Upgrades to a nested write lock once every plain reader has
    /// drained. The upgradeable read stays held underneath.
    pub async fn write(&self, flags: LockFlags) -> WriteGuard<'_, P> {
        self.lock.acquire(AcquireKind::Upgrade(flags)).await;
        WriteGuard { lock: self.lock }
    }

    /// Fetches the resource identified by `moniker`, prepared for the
    /// caller's lock mode, and remembers it as touched under this
    /// upgradeable read.
    pub async fn get_resource(
        &self,
        moniker: &P::Moniker,
    ) -> Result<Arc<P::Resource>, ResourceError<P::Error>> {
        self.lock.get_resource_inner(moniker).await
    }

    /// Explicitly tags `resource` as touched under this upgradeable read.
    pub fn mark_accessed(&self, resource: &Arc<P::Resource>) {
        self.lock.mark_accessed_inner(resource);
    }

    /// Runs `predicate` over a snapshot of the resources with live
    /// preparation records and tags every match as touched. Returns whether
    /// anything matched.
    pub fn mark_accessed_matching<F>(&self, predicate: F) -> bool
    where
        F: FnMut(&Arc<P::Resource>) -> bool,
    {
        self.lock.mark_accessed_matching_inner(predicate)
    }

    /// Releases the lock; completes when any release processing has too.
    pub async fn release(self) {
        let lock = self.lock;
        drop(self);
        lock.drive_release_work().await;
    }
}

impl<P: ResourceProvider> Drop for UpgradeableReadGuard<'_, P> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        let State { book, tables } = &mut *state;
        if book.release_upgradeable_read() {
            if book.disengage_sticky() {
                // The retained write exclusivity releases together with the
                // upgradeable read. With the upgradeable read gone no forced
                // re-preparations arise, only the wholesale invalidation.
                if let Some(work) = tables.on_exclusive_released(book, &self.lock.provider) {
                    book.park_release_work(work);
                }
            }
            tables.on_upgradeable_released();
        }
        book.wake_all();
    }
}

impl<P: ResourceProvider> fmt::Debug for UpgradeableReadGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("UpgradeableReadGuard")
    }
}

// === impl WriteGuard ===

/// Releases the exclusive write access when dropped.
///
/// Dropping the outermost write guard invalidates every prepared resource.
/// The asynchronous half of that processing, re-preparing whatever a
/// surrounding upgradeable read touched, is parked on the lock and is
/// completed before any subsequent acquisition is granted; [`release`]
/// awaits it explicitly.
///
/// [`release`]: WriteGuard::release
#[must_use = "if unused the lock will immediately unlock"]
pub struct WriteGuard<'a, P: ResourceProvider> {
    lock: &'a ResourceLock<P>,
}

impl<P: ResourceProvider> WriteGuard<'_, P> {
    /// Re-entrant read acquisition.
    pub async fn read(&self) -> ReadGuard<'_, P> {
        self.lock.acquire(AcquireKind::NestedRead).await;
        ReadGuard { lock: self.lock }
    }

    /// Re-entrant upgradeable read acquisition.
    pub async fn upgradeable_read(&self, flags: LockFlags) -> UpgradeableReadGuard<'_, P> {
        self.lock
            .acquire(AcquireKind::NestedUpgradeableRead(flags))
            .await;
        UpgradeableReadGuard { lock: self.lock }
    }

    /// Re-entrant write acquisition.
    pub async fn write(&self, flags: LockFlags) -> WriteGuard<'_, P> {
        self.lock.acquire(AcquireKind::NestedWrite(flags)).await;
        WriteGuard { lock: self.lock }
    }

    /// Fetches the resource identified by `moniker`, prepared for
    /// exclusive access.
    pub async fn get_resource(
        &self,
        moniker: &P::Moniker,
    ) -> Result<Arc<P::Resource>, ResourceError<P::Error>> {
        self.lock.get_resource_inner(moniker).await
    }

    pub fn mark_accessed(&self, resource: &Arc<P::Resource>) {
        self.lock.mark_accessed_inner(resource);
    }

    /// Runs `predicate` over a snapshot of the resources with live
    /// preparation records and tags every match as touched. Returns whether
    /// anything matched.
    pub fn mark_accessed_matching<F>(&self, predicate: F) -> bool
    where
        F: FnMut(&Arc<P::Resource>) -> bool,
    {
        self.lock.mark_accessed_matching_inner(predicate)
    }

    /// Forgets the prepared state of every resource. The next request for
    /// each one starts a fresh preparation, chained after whatever run came
    /// before it.
    pub fn mark_all_unknown(&self) {
        self.lock.state.lock().tables.mark_all_unknown();
    }

    /// Releases the lock and completes once the release processing has
    /// completed, including re-preparation of resources touched under a
    /// surrounding upgradeable read.
    pub async fn release(self) {
        let lock = self.lock;
        drop(self);
        lock.drive_release_work().await;
    }
}

impl<P: ResourceProvider> Drop for WriteGuard<'_, P> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        let State { book, tables } = &mut *state;
        match book.release_write() {
            WriteReleased::StillHeld | WriteReleased::Sticky => {}
            WriteReleased::Outermost => {
                if let Some(work) = tables.on_exclusive_released(book, &self.lock.provider) {
                    book.park_release_work(work);
                }
            }
        }
        book.wake_all();
    }
}

impl<P: ResourceProvider> fmt::Debug for WriteGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("WriteGuard")
    }
}
