//! Thread-safe LRU cache bounded by entry count
//!
//! Wraps [`lru::LruCache`] behind a mutex so the thumbnail cache can share
//! it between the caller's thread and the generation workers. The lock is
//! only held for the duration of a single map operation.

use parking_lot::Mutex;
use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// A thread-safe LRU map holding at most `capacity` entries
///
/// Both `get` and `insert` mark the entry as most recently used. Values are
/// cloned out on read, so `V` is normally a cheap handle such as an `Arc`.
pub struct MemoryCache<K: Hash + Eq, V> {
    inner: Mutex<lru::LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> MemoryCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    /// Get a value, promoting it to most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Check for a key without touching its recency
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Insert a value, evicting the least recently used entry when full
    pub fn insert(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.inner.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

impl<K: Hash + Eq, V> fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryCache")
            .field("len", &inner.len())
            .field("capacity", &inner.cap())
            .finish()
    }
}
