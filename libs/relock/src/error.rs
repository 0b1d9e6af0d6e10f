// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::error;
use std::fmt;
use std::sync::Arc;

use futures::task::SpawnError;

/// Error returned by [`get_resource`][crate::ReadGuard::get_resource].
///
/// A fetch failure belongs to the one caller whose fetch it was, so the
/// provider's error is carried by value. A preparation failure is observed
/// by every waiter joined on the same preparation.
pub enum ResourceError<E> {
    /// The provider failed to produce the resource for the given moniker.
    Fetch(E),
    /// The preparation transitioning the resource into the requested mode
    /// failed. The record stays in place; the next request for the same
    /// resource chains a fresh preparation after it.
    Prepare(PrepareError<E>),
}

/// Why a preparation run failed.
///
/// Both variants are observed by every waiter joined on the same run, so
/// the underlying error is shared behind an [`Arc`].
pub enum PrepareError<E> {
    /// The provider's preparation delegate returned an error.
    Provider(Arc<E>),
    /// The provider's spawner refused the preparation task, typically
    /// because its executor has shut down. The run never started.
    Spawner(Arc<SpawnError>),
}

impl<E> Clone for PrepareError<E> {
    fn clone(&self) -> Self {
        match self {
            PrepareError::Provider(err) => PrepareError::Provider(Arc::clone(err)),
            PrepareError::Spawner(err) => PrepareError::Spawner(Arc::clone(err)),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for PrepareError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepareError::Provider(err) => f.debug_tuple("Provider").field(err).finish(),
            PrepareError::Spawner(err) => f.debug_tuple("Spawner").field(err).finish(),
        }
    }
}

impl<E> fmt::Display for PrepareError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepareError::Provider(_) => f.write_str("the preparation delegate failed"),
            PrepareError::Spawner(_) => {
                f.write_str("the preparation task was rejected by its spawner")
            }
        }
    }
}

impl<E: error::Error + 'static> error::Error for PrepareError<E> {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            PrepareError::Provider(err) => Some(err.as_ref()),
            PrepareError::Spawner(err) => Some(err.as_ref()),
        }
    }
}

impl<E> ResourceError<E> {
    /// Returns `true` if the fetch itself failed.
    pub fn is_fetch(&self) -> bool {
        matches!(self, ResourceError::Fetch(_))
    }

    /// Returns `true` if the shared preparation failed.
    pub fn is_prepare(&self) -> bool {
        matches!(self, ResourceError::Prepare(_))
    }
}

impl<E: fmt::Debug> fmt::Debug for ResourceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::Fetch(err) => f.debug_tuple("Fetch").field(err).finish(),
            ResourceError::Prepare(err) => f.debug_tuple("Prepare").field(err).finish(),
        }
    }
}

impl<E> fmt::Display for ResourceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::Fetch(_) => f.write_str("failed to fetch the resource"),
            ResourceError::Prepare(_) => f.write_str("resource preparation failed"),
        }
    }
}

impl<E: error::Error + 'static> error::Error for ResourceError<E> {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ResourceError::Fetch(err) => Some(err),
            ResourceError::Prepare(err) => Some(err),
        }
    }
}
