// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all, ready};
use futures::task::{FutureObj, Spawn};

use crate::book::{LockBook, LockFlags};
use crate::error::PrepareError;
use crate::provider::ResourceProvider;
use crate::record::{Mode, PreparationRecord};
use crate::shared::{Join, PrepFuture, Settle, Settled};
use crate::weak_map::WeakKeyMap;

/// Per-lock resource state: the preparation record table and the set of
/// resources fetched under the current upgradeable read.
///
/// Every method here runs with the lock's private mutex held. Nothing in
/// this module awaits or invokes provider code under that mutex; delegates
/// are captured into futures that run only once the mutex is long gone.
pub(crate) struct ResourceTables<P: ResourceProvider> {
    records: WeakKeyMap<P::Resource, PreparationRecord<P::Error>>,
    /// Resources fetched inside the outermost upgradeable read, keyed by
    /// allocation identity. Cleared when the upgradeable read releases.
    accessed: HashMap<usize, Arc<P::Resource>>,
}

/// Whether a chained preparation re-runs its delegate unconditionally or
/// only when the predecessor failed to produce an outcome.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Rerun {
    Always,
    IfUnfinished,
}

fn delegate<P: ResourceProvider>(
    provider: &Arc<P>,
    resource: &Arc<P::Resource>,
    mode: Mode,
    flags: LockFlags,
) -> PrepFuture<P::Error> {
    let provider = Arc::clone(provider);
    let resource = Arc::clone(resource);
    Box::pin(async move {
        match mode {
            Mode::Concurrent => provider
                .prepare_concurrent(&resource)
                .await
                .map_err(|error| PrepareError::Provider(Arc::new(error))),
            Mode::Exclusive => provider
                .prepare_exclusive(&resource, flags)
                .await
                .map_err(|error| PrepareError::Provider(Arc::new(error))),
            Mode::Unknown => unreachable!("invalidation placeholders have no delegate"),
        }
    })
}

/// Chains `next` after a predecessor so preparations for one resource
/// never overlap.
fn chain<E: Send + Sync + 'static>(
    predecessor: Settle<E>,
    next: PrepFuture<E>,
    policy: Rerun,
) -> PrepFuture<E> {
    Box::pin(async move {
        match (policy, predecessor.await) {
            (Rerun::IfUnfinished, Settled::Completed(Ok(()))) => Ok(()),
            _ => next.await,
        }
    })
}

/// Dispatches the whole (possibly chained) run through the provider's
/// spawner, when it has one. Cancellation still follows the waiters: the
/// remote run is dropped when its handle is.
fn spawn_on<E: Send + Sync + 'static>(
    spawner: Option<Arc<dyn Spawn + Send + Sync>>,
    inner: PrepFuture<E>,
) -> PrepFuture<E> {
    match spawner {
        None => inner,
        Some(spawner) => {
            let (remote, handle) = inner.remote_handle();
            match spawner.spawn_obj(FutureObj::new(Box::new(remote))) {
                Ok(()) => Box::pin(handle),
                Err(error) => {
                    // The spawner's executor has shut down; the run never
                    // started. The record faults with the rejection and the
                    // next request chains a fresh attempt.
                    tracing::warn!(%error, "preparation spawner rejected the task");
                    Box::pin(ready(Err(PrepareError::Spawner(Arc::new(error)))))
                }
            }
        }
    }
}

impl<P: ResourceProvider> ResourceTables<P> {
    pub(crate) fn new() -> Self {
        Self {
            records: WeakKeyMap::new(),
            accessed: HashMap::new(),
        }
    }

    /// Returns the preparation this caller awaits for `resource`, starting,
    /// joining or chaining a run as the table demands.
    ///
    /// The target mode follows the ambient lock state unless
    /// `force_concurrent` overrides it; forced runs are pinned because they
    /// have no caller whose abandonment should cancel them.
    pub(crate) fn prepare(
        &mut self,
        resource: &Arc<P::Resource>,
        force_concurrent: bool,
        book: &LockBook,
        provider: &Arc<P>,
    ) -> Join<P::Error> {
        let mode = if force_concurrent || !book.is_write_locked() {
            Mode::Concurrent
        } else {
            Mode::Exclusive
        };
        let pin = force_concurrent;
        let spawner = provider.preparation_spawner(resource);
        let flags = book.aggregate_flags();

        let (record, join) = match self.records.get(resource) {
            None => {
                tracing::trace!(%mode, "starting preparation");
                let inner = delegate(provider, resource, mode, flags);
                PreparationRecord::start(mode, spawn_on(spawner, inner), pin)
            }
            Some(prior) => {
                if prior.target() != mode || prior.is_faulted() {
                    tracing::trace!(
                        from = %prior.target(),
                        to = %mode,
                        "chaining preparation after predecessor",
                    );
                    let inner = chain(
                        prior.observe(),
                        delegate(provider, resource, mode, flags),
                        Rerun::Always,
                    );
                    PreparationRecord::start(mode, spawn_on(spawner, inner), pin)
                } else if let Some(join) = prior.try_join() {
                    return join;
                } else {
                    // Cancelled after every waiter abandoned it. Replace the
                    // record; should the run have completed after all, its
                    // outcome is reused instead of re-running the delegate.
                    debug_assert!(prior.is_cancelled());
                    tracing::trace!(%mode, "restarting abandoned preparation");
                    let inner = chain(
                        prior.observe(),
                        delegate(provider, resource, mode, flags),
                        Rerun::IfUnfinished,
                    );
                    PreparationRecord::start(mode, spawn_on(spawner, inner), pin)
                }
            }
        };
        self.records.set(resource, record);
        join
    }

    /// Tags `resource` as touched under the current upgradeable read.
    ///
    /// No-op unless an upgradeable read is held without write exclusivity;
    /// resources touched while a write is held are invalidated wholesale on
    /// its release and need no tagging.
    pub(crate) fn mark_accessed(&mut self, book: &LockBook, resource: &Arc<P::Resource>) -> bool {
        if !book.is_upgradeable_read_locked() || book.is_write_locked() {
            return false;
        }
        self.accessed
            .insert(Arc::as_ptr(resource) as usize, Arc::clone(resource));
        true
    }

    /// Snapshot of every resource with a live record. Strong references,
    /// so callers may inspect them with the mutex released.
    pub(crate) fn snapshot_resources(&mut self) -> Vec<Arc<P::Resource>> {
        self.records
            .iter_snapshot()
            .into_iter()
            .map(|(resource, _)| resource)
            .collect()
    }

    /// Replaces every record with an Unknown placeholder whose run awaits
    /// the predecessor and completes. Placeholders are pinned and lazy:
    /// nothing runs until a future request for the resource chains off one.
    pub(crate) fn mark_all_unknown(&mut self) {
        for (resource, prior) in self.records.iter_snapshot() {
            let predecessor = prior.observe();
            let inner: PrepFuture<P::Error> = Box::pin(async move {
                let _ = predecessor.await;
                Ok(())
            });
            let (record, _join) = PreparationRecord::start(Mode::Unknown, inner, true);
            self.records.set(&resource, record);
        }
        tracing::debug!(records = self.records.len(), "all resources marked unknown");
    }

    /// Exclusive-release processing: every record becomes Unknown, and when
    /// an upgradeable read is still held, everything it touched is
    /// re-prepared for concurrent access.
    ///
    /// The returned future completes when every forced re-preparation has
    /// settled; `None` when there are none.
    pub(crate) fn on_exclusive_released(
        &mut self,
        book: &LockBook,
        provider: &Arc<P>,
    ) -> Option<BoxFuture<'static, ()>> {
        self.mark_all_unknown();
        if !book.is_upgradeable_read_locked() || self.accessed.is_empty() {
            return None;
        }
        let targets: Vec<Arc<P::Resource>> = self.accessed.values().cloned().collect();
        let joins: Vec<Join<P::Error>> = targets
            .iter()
            .map(|resource| self.prepare(resource, true, book, provider))
            .collect();
        tracing::debug!(
            resources = joins.len(),
            "re-preparing resources touched under the upgradeable read",
        );
        Some(Box::pin(async move {
            for outcome in join_all(joins).await {
                if let Err(err) = outcome {
                    tracing::warn!(%err, "release-time re-preparation failed");
                }
            }
        }))
    }

    pub(crate) fn on_upgradeable_released(&mut self) {
        self.accessed.clear();
    }

    #[cfg(test)]
    pub(crate) fn record_target(&self, resource: &Arc<P::Resource>) -> Option<Mode> {
        self.records.get(resource).map(|record| record.target())
    }

    #[cfg(test)]
    pub(crate) fn record_count(&mut self) -> usize {
        self.records.iter_snapshot().len()
    }

    #[cfg(test)]
    pub(crate) fn accessed_count(&self) -> usize {
        self.accessed.len()
    }
}

impl<P: ResourceProvider> fmt::Debug for ResourceTables<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTables")
            .field("records", &self.records)
            .field("accessed", &self.accessed.len())
            .finish()
    }
}
