//! Single-flight memoization of fetches.

use crate::error::{FetchError, FetchResult};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    hash::Hash,
    sync::Arc,
};

/// The shared, single-evaluation result of a fetch.
pub type MemoFuture<V> = Shared<BoxFuture<'static, FetchResult<V>>>;

/// A map of in-flight and completed fetches for one key space.
///
/// The first caller for a key starts the fetch on a background task, every later caller,
/// including the ones arriving after completion, awaits the same shared future. Failures are
/// kept just like successes. Entries are never evicted.
///
/// Only the map itself is guarded; the fetch runs outside the lock.
pub struct Memo<K, V> {
    name: &'static str,
    entries: Arc<Mutex<HashMap<K, MemoFuture<V>>>>,
}

impl<K, V> Clone for Memo<K, V> {
    fn clone(&self) -> Self {
        Self { name: self.name, entries: Arc::clone(&self.entries) }
    }
}

impl<K, V> fmt::Debug for Memo<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo").field("name", &self.name).field("len", &self.entries.lock().len()).finish()
    }
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash + fmt::Debug + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty memo, `name` is only used for logging.
    pub fn new(name: &'static str) -> Self {
        Self { name, entries: Default::default() }
    }

    /// Resolves `key`, starting `fetch` only if nobody requested the key before.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> FetchResult<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let fut = match self.entries.lock().entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                trace!(target: "fork::memo", memo = self.name, key = ?entry.key(), "starting fetch");
                let task = tokio::spawn(fetch());
                let fut = async move {
                    task.await.unwrap_or_else(|err| Err(FetchError::Aborted(err.to_string().into())))
                }
                .boxed()
                .shared();
                entry.insert(fut.clone());
                fut
            }
        };
        fut.await
    }

    /// Stores an already known value for `key` unless the key was requested before.
    ///
    /// Returns `true` if the value was inserted.
    pub fn seed(&self, key: K, value: V) -> bool {
        match self.entries.lock().entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let fut = futures::future::ready(Ok(value)).boxed().shared();
                // resolve it now so `peek` and `resolved` see the value
                let _ = fut.clone().now_or_never();
                entry.insert(fut);
                true
            }
        }
    }

    /// Returns the shared result of `key` if it was requested or seeded before.
    pub fn get(&self, key: &K) -> Option<MemoFuture<V>> {
        self.entries.lock().get(key).cloned()
    }

    /// Returns all keys that resolved successfully, with their values.
    pub fn resolved(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        self.entries
            .lock()
            .iter()
            .filter_map(|(key, fut)| match fut.peek() {
                Some(Ok(value)) => Some((key.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if `key` was requested or seeded before.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Returns the result for `key` if it is already resolved.
    pub fn peek(&self, key: &K) -> Option<FetchResult<V>> {
        self.entries.lock().get(key).and_then(|fut| fut.peek().cloned())
    }

    /// Number of keys requested or seeded so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no key was requested or seeded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
