//! Memoized in-flight fetches keyed by URL.
//!
//! The future (not its value) is inserted under the lock, so every concurrent
//! requester of a URL ends up polling the same fetch. Nothing is evicted until
//! the cache itself is dropped or cleared.

use crate::entry::EntryHandle;
use crate::error::{Error, FetchError};
use deno_core::futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

/// A fetch whose outcome can be awaited by any number of callers.
pub type SharedFuture<T> = Shared<BoxFuture<'static, T>>;

/// Shared text of a style or script.
pub type SharedText = SharedFuture<Result<String, FetchError>>;

/// A URL keyed map of shared futures.
pub struct FutureCache<T: Clone> {
    entries: Mutex<HashMap<String, SharedFuture<T>>>,
}

impl<T> FutureCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached future for `key`, creating it with `make` on first use.
    pub fn get_or_insert_with<F, Fut>(&self, key: &str, make: F) -> SharedFuture<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key.to_string())
            .or_insert_with(|| make().boxed().shared())
            .clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl<T> Default for FutureCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Per-kind caches for everything the loader downloads.
///
/// Kinds are kept apart so that a URL requested as a style never answers a
/// script request (or a whole document request).
#[derive(Default)]
pub struct ResourceCache {
    pub styles: FutureCache<Result<String, FetchError>>,
    pub scripts: FutureCache<Result<String, FetchError>>,
    pub documents: FutureCache<Result<EntryHandle, Error>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached entry of every kind.
    pub fn clear(&self) {
        self.styles.clear();
        self.scripts.clear();
        self.documents.clear();
    }
}
