// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::error;
use std::sync::Arc;

use async_trait::async_trait;
use futures::task::Spawn;

use crate::book::LockFlags;

/// Supplies the resources guarded by a [`ResourceLock`][crate::ResourceLock]
/// and the work that transitions them between access modes.
///
/// The lock runs at most one preparation per resource at a time, chains a
/// new preparation after whatever run came before it, and shares one run
/// among every concurrent waiter. `prepare_concurrent` and
/// `prepare_exclusive` are therefore never invoked concurrently for the
/// same resource, and a completed preparation is reused until a write
/// release invalidates it.
///
/// Preparation delegates receive no lock guard and must not attempt to
/// acquire one; by the time a delegate runs, its caller may be holding any
/// lock mode.
#[async_trait]
pub trait ResourceProvider: Send + Sync + 'static {
    /// Caller-supplied handle identifying which resource is wanted.
    type Moniker: Send + Sync;
    /// The guarded resource. Identity is the [`Arc`] allocation; the lock
    /// holds only weak references, so dropping the last strong reference
    /// outside the lock reclaims the resource and its bookkeeping.
    type Resource: Send + Sync + 'static;
    type Error: error::Error + Send + Sync + 'static;

    /// Produces the resource identified by `moniker`.
    ///
    /// Called on every `get_resource`; caching by moniker, when wanted, is
    /// this trait's concern. The lock caches per resource, not per
    /// moniker.
    async fn fetch(&self, moniker: &Self::Moniker) -> Result<Arc<Self::Resource>, Self::Error>;

    /// Transitions `resource` into a state fit for shared, concurrent
    /// access.
    async fn prepare_concurrent(&self, resource: &Arc<Self::Resource>) -> Result<(), Self::Error>;

    /// Transitions `resource` into a state fit for exclusive access.
    ///
    /// `flags` is the union of the flags of every lock the requesting
    /// continuation holds; [`LockFlags::SKIP_INITIAL_PREPARATION`] arrives
    /// here uninterpreted.
    async fn prepare_exclusive(
        &self,
        resource: &Arc<Self::Resource>,
        flags: LockFlags,
    ) -> Result<(), Self::Error>;

    /// Where preparations for `resource` should run.
    ///
    /// `None` (the default) lets the waiters poll the preparation inline.
    /// Returning a spawner dispatches the preparation onto it; dropping
    /// every waiter still cancels the remote run.
    ///
    /// Called with the lock's internal state borrowed; implementations
    /// must return quickly and must not call back into the lock.
    fn preparation_spawner(
        &self,
        resource: &Arc<Self::Resource>,
    ) -> Option<Arc<dyn Spawn + Send + Sync>> {
        let _ = resource;
        None
    }
}
