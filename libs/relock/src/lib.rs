// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A resource-preparing asynchronous reader/writer lock.
//!
//! [`ResourceLock`] guards mutually exclusive access *and* the state of the
//! resources accessed while holding it. A [`ResourceProvider`] supplies the
//! resources and the asynchronous, fallible work that transitions each one
//! into a state fit for concurrent or for exclusive access. The lock runs
//! that work at most once per mode transition and shares one run among
//! every concurrent waiter; successive runs for the same resource are
//! serialized even across mode switches.
//!
//! Waiters cancel by dropping their future; a run is only cancelled when
//! every waiter has abandoned it. Releasing the outermost write lock
//! forgets the prepared state of every resource, and whatever a still-held
//! upgradeable read had touched is re-prepared for concurrent access
//! before the lock admits anyone else.

mod book;
mod error;
mod lock;
mod provider;
mod record;
mod shared;
mod tables;
mod weak_map;

#[cfg(test)]
mod tests;

pub use book::LockFlags;
pub use error::{PrepareError, ResourceError};
pub use lock::{ReadGuard, ResourceLock, UpgradeableReadGuard, WriteGuard};
pub use provider::ResourceProvider;
