//! Single-flight coalescing of identical concurrent operations
//!
//! Deduplicates concurrent fetches for the same key into one in-flight
//! future whose result every caller shares. The first caller for a key
//! installs a shared future; later arrivals clone and await it. Because the
//! future is shared, a cancelled leader does not abort the group: whichever
//! awaiter polls next continues driving the fetch.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::Error;

type FlightFuture<T> = Shared<BoxFuture<'static, Result<T, Arc<Error>>>>;

/// A keyed group of in-flight operations.
///
/// Errors are wrapped in `Arc` so a single failure can be handed to every
/// attached caller.
pub struct FlightGroup<T: Clone> {
    inflight: DashMap<String, FlightFuture<T>>,
}

impl<T: Clone> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FlightGroup<T> {
    /// Create an empty group
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Number of keys currently in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Whether no operation is currently in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

impl<T: Clone + Send + Sync + 'static> FlightGroup<T> {
    /// Run `make()` under `key`, attaching to an existing flight if one is
    /// already running for that key.
    ///
    /// `make` is only invoked when no flight exists; all callers for the
    /// same key observe the same success or failure.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T, Arc<Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>> + Send + 'static,
    {
        let flight = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(attached) => attached.get().clone(),
            Entry::Vacant(slot) => {
                let fut = make().map(|r| r.map_err(Arc::new)).boxed().shared();
                slot.insert(fut.clone());
                fut
            }
        };

        let result = flight.clone().await;

        // Drop the completed flight so the next miss starts fresh. The
        // pointer guard keeps a slow awaiter from evicting a newer flight
        // that reused the key.
        self.inflight.remove_if(key, |_, f| f.ptr_eq(&flight));

        result
    }
}
