// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-module scenario tests for the resource-preparing lock.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Poll, Waker};

use async_trait::async_trait;
use futures::executor::block_on;
use futures::task::Spawn;
use parking_lot::Mutex;
use tokio_test::task;
use tokio_test::{assert_pending, assert_ready};

use crate::record::Mode;
use crate::{LockFlags, ResourceLock, ResourceProvider};

/// Routes events to the test writer for runs with `RUST_LOG` set.
fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
struct PrepError(&'static str);

impl fmt::Display for PrepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.0)
    }
}

impl error::Error for PrepError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Fetch,
    ConcurrentStart,
    ConcurrentEnd,
    ExclusiveStart(LockFlags),
    ExclusiveEnd,
}

/// A manually opened barrier preparations can be parked on.
#[derive(Clone)]
struct Gate(Arc<Mutex<GateState>>);

struct GateState {
    open: bool,
    waiters: Vec<Waker>,
}

impl Gate {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(GateState {
            open: false,
            waiters: Vec::new(),
        })))
    }

    fn open(&self) {
        let mut state = self.0.lock();
        state.open = true;
        for waker in state.waiters.drain(..) {
            waker.wake();
        }
    }

    async fn wait(&self) {
        futures::future::poll_fn(|cx| {
            let mut state = self.0.lock();
            if state.open {
                Poll::Ready(())
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
    }
}

/// Increments a counter when dropped before the run finished.
struct CancelProbe<'a> {
    cancelled: &'a AtomicUsize,
    armed: bool,
}

impl<'a> CancelProbe<'a> {
    fn armed(cancelled: &'a AtomicUsize) -> Self {
        Self {
            cancelled,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelProbe<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
struct Res {
    name: &'static str,
}

struct TestProvider {
    resources: Mutex<HashMap<&'static str, Arc<Res>>>,
    events: Mutex<Vec<Event>>,
    concurrent_gate: Mutex<Option<Gate>>,
    fail_fetch_once: AtomicBool,
    fail_concurrent_once: AtomicBool,
    cancelled: AtomicUsize,
    spawner: Mutex<Option<Arc<dyn Spawn + Send + Sync>>>,
}

impl TestProvider {
    fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            concurrent_gate: Mutex::new(None),
            fail_fetch_once: AtomicBool::new(false),
            fail_concurrent_once: AtomicBool::new(false),
            cancelled: AtomicUsize::new(0),
            spawner: Mutex::new(None),
        }
    }

    /// Parks every subsequent concurrent preparation until the returned
    /// gate opens.
    fn gate_concurrent(&self) -> Gate {
        let gate = Gate::new();
        *self.concurrent_gate.lock() = Some(gate.clone());
        gate
    }

    fn fail_fetch_once(&self) {
        self.fail_fetch_once.store(true, Ordering::SeqCst);
    }

    fn fail_concurrent_once(&self) {
        self.fail_concurrent_once.store(true, Ordering::SeqCst);
    }

    fn spawn_on(&self, spawner: Arc<dyn Spawn + Send + Sync>) {
        *self.spawner.lock() = Some(spawner);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn preparation_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| !matches!(event, Event::Fetch))
            .collect()
    }

    fn concurrent_starts(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::ConcurrentStart))
            .count()
    }

    fn concurrent_ends(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::ConcurrentEnd))
            .count()
    }

    fn exclusive_starts(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::ExclusiveStart(_)))
            .count()
    }

    fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The cached resource for `moniker`; the entry must exist.
    fn resource(&self, moniker: &'static str) -> Arc<Res> {
        Arc::clone(&self.resources.lock()[moniker])
    }

    /// Drops the cached strong reference for `moniker`.
    fn forget(&self, moniker: &'static str) {
        self.resources.lock().remove(moniker);
    }
}

#[async_trait]
impl ResourceProvider for TestProvider {
    type Moniker = &'static str;
    type Resource = Res;
    type Error = PrepError;

    async fn fetch(&self, moniker: &&'static str) -> Result<Arc<Res>, PrepError> {
        let moniker = *moniker;
        self.events.lock().push(Event::Fetch);
        if self.fail_fetch_once.swap(false, Ordering::SeqCst) {
            return Err(PrepError("fetch failed"));
        }
        Ok(Arc::clone(
            self.resources
                .lock()
                .entry(moniker)
                .or_insert_with(|| Arc::new(Res { name: moniker })),
        ))
    }

    async fn prepare_concurrent(&self, _resource: &Arc<Res>) -> Result<(), PrepError> {
        self.events.lock().push(Event::ConcurrentStart);
        let probe = CancelProbe::armed(&self.cancelled);
        let gate = self.concurrent_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        if self.fail_concurrent_once.swap(false, Ordering::SeqCst) {
            probe.disarm();
            return Err(PrepError("concurrent preparation failed"));
        }
        probe.disarm();
        self.events.lock().push(Event::ConcurrentEnd);
        Ok(())
    }

    async fn prepare_exclusive(
        &self,
        _resource: &Arc<Res>,
        flags: LockFlags,
    ) -> Result<(), PrepError> {
        self.events.lock().push(Event::ExclusiveStart(flags));
        self.events.lock().push(Event::ExclusiveEnd);
        Ok(())
    }

    fn preparation_spawner(
        &self,
        _resource: &Arc<Res>,
    ) -> Option<Arc<dyn Spawn + Send + Sync>> {
        self.spawner.lock().clone()
    }
}

#[test]
fn concurrent_readers_share_one_preparation() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let r1 = lock.read().await;
        let r2 = lock.read().await;

        let (a, b) = futures::join!(r1.get_resource(&"m"), r2.get_resource(&"m"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(lock.provider().concurrent_starts(), 1);
    });
}

#[test]
fn in_flight_preparation_is_joined_not_restarted() {
    trace_init();
    let provider = TestProvider::new();
    let gate = provider.gate_concurrent();
    let lock = ResourceLock::new(provider);

    let r1 = block_on(lock.read());
    let r2 = block_on(lock.read());
    let mut f1 = task::spawn(r1.get_resource(&"m"));
    let mut f2 = task::spawn(r2.get_resource(&"m"));

    assert_pending!(f1.poll());
    assert_pending!(f2.poll());
    assert_eq!(lock.provider().concurrent_starts(), 1);

    gate.open();
    assert_ready!(f1.poll()).unwrap();
    assert_ready!(f2.poll()).unwrap();
    assert_eq!(lock.provider().concurrent_starts(), 1);
    assert_eq!(lock.provider().concurrent_ends(), 1);
}

#[test]
fn mode_switch_chains_exclusive_after_concurrent() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());

        let first = {
            let read = lock.read().await;
            read.get_resource(&"m").await.unwrap()
        };

        let write = lock.write(LockFlags::empty()).await;
        let again = write.get_resource(&"m").await.unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(
            lock.provider().preparation_events(),
            [
                Event::ConcurrentStart,
                Event::ConcurrentEnd,
                Event::ExclusiveStart(LockFlags::empty()),
                Event::ExclusiveEnd,
            ],
        );
        drop(write);
    });
}

#[test]
fn preparations_for_one_resource_never_overlap() {
    trace_init();
    let provider = TestProvider::new();
    let gate = provider.gate_concurrent();
    let lock = ResourceLock::new(provider);

    let upgradeable = block_on(lock.upgradeable_read(LockFlags::empty()));
    let mut f1 = task::spawn(upgradeable.get_resource(&"m"));
    assert_pending!(f1.poll());

    // Upgrade while the concurrent preparation is still in flight. The
    // exclusive preparation must chain after it, not race it.
    let write = block_on(upgradeable.write(LockFlags::empty()));
    let mut f2 = task::spawn(write.get_resource(&"m"));
    assert_pending!(f2.poll());
    assert_eq!(lock.provider().exclusive_starts(), 0);

    gate.open();
    assert_ready!(f1.poll()).unwrap();
    assert_ready!(f2.poll()).unwrap();
    assert_eq!(
        lock.provider().preparation_events(),
        [
            Event::ConcurrentStart,
            Event::ConcurrentEnd,
            Event::ExclusiveStart(LockFlags::empty()),
            Event::ExclusiveEnd,
        ],
    );

    drop(f2);
    drop(write);
    drop(f1);
    drop(upgradeable);
}

#[test]
fn release_reprepares_resources_touched_under_upgradeable_read() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let upgradeable = lock.upgradeable_read(LockFlags::empty()).await;
        let resource = upgradeable.get_resource(&"m").await.unwrap();
        assert_eq!(lock.accessed_count(), 1);

        let write = upgradeable.write(LockFlags::empty()).await;
        let same = write.get_resource(&"m").await.unwrap();
        assert!(Arc::ptr_eq(&resource, &same));
        write.release().await;

        // The release processing re-prepared the touched resource for
        // concurrent access before completing.
        assert_eq!(lock.provider().concurrent_starts(), 2);
        assert_eq!(lock.provider().events().last(), Some(&Event::ConcurrentEnd));
        assert_eq!(lock.record_target(&resource), Some(Mode::Concurrent));

        drop(upgradeable);
        assert_eq!(lock.accessed_count(), 0);
    });
}

#[test]
fn next_acquirer_observes_the_reprepared_state() {
    let lock = ResourceLock::new(TestProvider::new());
    let upgradeable = block_on(lock.upgradeable_read(LockFlags::empty()));
    block_on(upgradeable.get_resource(&"m")).unwrap();

    let write = block_on(upgradeable.write(LockFlags::empty()));
    block_on(write.get_resource(&"m")).unwrap();
    drop(write);

    // The re-preparation is parked, not yet run.
    assert_eq!(lock.provider().concurrent_starts(), 1);

    // A new acquirer drives it to completion before its own grant.
    let read = block_on(lock.read());
    assert_eq!(lock.provider().concurrent_starts(), 2);
    assert_eq!(lock.provider().concurrent_ends(), 2);

    drop(read);
    drop(upgradeable);
}

#[test]
fn upgradeable_holder_reprepares_before_touching_resources_again() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let upgradeable = lock.upgradeable_read(LockFlags::empty()).await;
        upgradeable.get_resource(&"m").await.unwrap();

        let write = upgradeable.write(LockFlags::empty()).await;
        write.get_resource(&"m").await.unwrap();
        drop(write);

        upgradeable.get_resource(&"m2").await.unwrap();
        assert_eq!(lock.provider().concurrent_starts(), 3);

        // The forced re-preparation of "m" finished before "m2" was fetched.
        let events = lock.provider().events();
        let last_fetch = events
            .iter()
            .rposition(|event| matches!(event, Event::Fetch))
            .unwrap();
        let ends_before_fetch = events[..last_fetch]
            .iter()
            .filter(|event| matches!(event, Event::ConcurrentEnd))
            .count();
        assert_eq!(ends_before_fetch, 2, "events: {events:?}");

        drop(upgradeable);
    });
}

#[test]
fn cancelling_one_waiter_leaves_the_rest_undisturbed() {
    let provider = TestProvider::new();
    let gate = provider.gate_concurrent();
    let lock = ResourceLock::new(provider);

    let r1 = block_on(lock.read());
    let r2 = block_on(lock.read());
    let r3 = block_on(lock.read());
    let mut f1 = task::spawn(r1.get_resource(&"m"));
    let mut f2 = task::spawn(r2.get_resource(&"m"));
    let mut f3 = task::spawn(r3.get_resource(&"m"));

    assert_pending!(f1.poll());
    assert_pending!(f2.poll());
    assert_pending!(f3.poll());

    drop(f2);
    assert_eq!(lock.provider().cancelled(), 0);

    gate.open();
    assert_ready!(f1.poll()).unwrap();
    assert_ready!(f3.poll()).unwrap();
    assert_eq!(lock.provider().concurrent_starts(), 1);
    assert_eq!(lock.provider().concurrent_ends(), 1);
}

#[test]
fn abandoning_every_waiter_cancels_and_the_next_request_restarts() {
    trace_init();
    let provider = TestProvider::new();
    let gate = provider.gate_concurrent();
    let lock = ResourceLock::new(provider);

    let r1 = block_on(lock.read());
    let r2 = block_on(lock.read());
    let mut f1 = task::spawn(r1.get_resource(&"m"));
    let mut f2 = task::spawn(r2.get_resource(&"m"));
    assert_pending!(f1.poll());
    assert_pending!(f2.poll());

    drop(f1);
    drop(f2);
    assert_eq!(lock.provider().cancelled(), 1);

    // A later reader triggers a fresh preparation.
    let r3 = block_on(lock.read());
    let mut f3 = task::spawn(r3.get_resource(&"m"));
    assert_pending!(f3.poll());
    assert_eq!(lock.provider().concurrent_starts(), 2);

    gate.open();
    assert_ready!(f3.poll()).unwrap();
    assert_eq!(lock.provider().concurrent_ends(), 1);
}

#[test]
fn preparation_failure_is_shared_and_recovered_from() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        lock.provider().fail_concurrent_once();

        let read = lock.read().await;
        let err = read.get_resource(&"m").await.unwrap_err();
        assert!(err.is_prepare());

        // The faulted record stays; the next request chains a fresh run.
        let resource = read.get_resource(&"m").await.unwrap();
        assert_eq!(resource.name, "m");
        assert_eq!(lock.provider().concurrent_starts(), 2);
    });
}

#[test]
fn fetch_failures_belong_to_the_caller() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        lock.provider().fail_fetch_once();

        let read = lock.read().await;
        let err = read.get_resource(&"m").await.unwrap_err();
        assert!(err.is_fetch());
        assert_eq!(lock.record_count(), 0);

        assert!(read.get_resource(&"m").await.is_ok());
    });
}

#[test]
fn mark_all_unknown_forces_fresh_preparation() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let write = lock.write(LockFlags::empty()).await;
        let resource = write.get_resource(&"m").await.unwrap();
        assert_eq!(lock.provider().exclusive_starts(), 1);

        write.mark_all_unknown();
        assert_eq!(lock.record_target(&resource), Some(Mode::Unknown));

        write.get_resource(&"m").await.unwrap();
        assert_eq!(lock.provider().exclusive_starts(), 2);
        drop(write);
    });
}

#[test]
fn write_release_marks_every_record_unknown() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        {
            let write = lock.write(LockFlags::empty()).await;
            write.get_resource(&"m").await.unwrap();
            write.release().await;
        }
        let resource = lock.provider().resource("m");
        assert_eq!(lock.record_target(&resource), Some(Mode::Unknown));

        // Any subsequent access must prepare anew.
        let read = lock.read().await;
        read.get_resource(&"m").await.unwrap();
        assert_eq!(lock.provider().concurrent_starts(), 1);
        assert_eq!(lock.record_target(&resource), Some(Mode::Concurrent));
    });
}

#[test]
fn sticky_release_invalidates_on_upgradeable_release() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let upgradeable = lock.upgradeable_read(LockFlags::STICKY_WRITE).await;
        {
            let write = upgradeable.write(LockFlags::empty()).await;
            write.get_resource(&"m").await.unwrap();
        }
        // Exclusivity is retained; nothing has been invalidated yet.
        let resource = lock.provider().resource("m");
        assert_eq!(lock.record_target(&resource), Some(Mode::Exclusive));
        assert!(lock.is_write_locked());

        upgradeable.release().await;
        assert_eq!(lock.record_target(&resource), Some(Mode::Unknown));
        assert!(!lock.is_write_locked());
    });
}

#[test]
fn failed_release_time_preparation_leaves_the_record_faulted() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let upgradeable = lock.upgradeable_read(LockFlags::empty()).await;
        upgradeable.get_resource(&"m").await.unwrap();

        let write = upgradeable.write(LockFlags::empty()).await;
        write.get_resource(&"m").await.unwrap();

        lock.provider().fail_concurrent_once();
        // The forced re-preparation fails; the release still completes.
        write.release().await;
        assert_eq!(lock.provider().concurrent_starts(), 2);

        // The next request chains a fresh run past the fault.
        upgradeable.get_resource(&"m").await.unwrap();
        assert_eq!(lock.provider().concurrent_starts(), 3);

        drop(upgradeable);
    });
}

#[test]
fn mark_accessed_matching_reports_whether_anything_matched() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let upgradeable = lock.upgradeable_read(LockFlags::empty()).await;
        upgradeable.get_resource(&"a").await.unwrap();
        upgradeable.get_resource(&"b").await.unwrap();

        assert!(upgradeable.mark_accessed_matching(|resource| resource.name == "a"));
        assert!(!upgradeable.mark_accessed_matching(|resource| resource.name == "zzz"));

        drop(upgradeable);
    });
}

#[test]
fn mark_accessed_is_a_noop_outside_an_upgradeable_read() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let read = lock.read().await;
        let resource = read.get_resource(&"m").await.unwrap();
        read.mark_accessed(&resource);
        assert_eq!(lock.accessed_count(), 0);
    });
}

#[test]
fn aggregate_flags_reach_the_exclusive_preparation() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        let upgradeable = lock
            .upgradeable_read(LockFlags::SKIP_INITIAL_PREPARATION)
            .await;
        let write = upgradeable.write(LockFlags::empty()).await;
        write.get_resource(&"m").await.unwrap();

        assert!(
            lock.provider()
                .events()
                .contains(&Event::ExclusiveStart(LockFlags::SKIP_INITIAL_PREPARATION)),
        );
        drop(write);
        drop(upgradeable);
    });
}

#[test]
fn reclaimed_resources_fall_out_of_the_table() {
    block_on(async {
        let lock = ResourceLock::new(TestProvider::new());
        {
            let read = lock.read().await;
            let resource = read.get_resource(&"m").await.unwrap();
            drop(resource);
        }
        assert_eq!(lock.record_count(), 1);

        lock.provider().forget("m");
        assert_eq!(lock.record_count(), 0);
    });
}

#[test]
fn preparations_can_run_on_a_spawner() {
    let pool = futures::executor::ThreadPool::new().unwrap();
    let provider = TestProvider::new();
    provider.spawn_on(Arc::new(pool));
    let lock = ResourceLock::new(provider);

    block_on(async {
        let read = lock.read().await;
        let resource = read.get_resource(&"m").await.unwrap();
        assert_eq!(resource.name, "m");
    });
    assert_eq!(lock.provider().concurrent_starts(), 1);
    assert_eq!(lock.provider().concurrent_ends(), 1);
}
