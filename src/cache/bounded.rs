//! Bounded key/value cache with least-recently-used eviction.
//!
//! Removal from the map happens synchronously under the cache lock; the
//! removed value is then handed to the eviction queue, which runs the
//! callback on its own thread.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::eviction::{EvictionCallback, EvictionQueue};
use crate::error::SchedulerError;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Least recently used entry dropped to stay within capacity.
    Capacity,
    /// A newer value was put under the same key.
    Replaced,
}

/// Record of an entry displaced by `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction<K> {
    /// Key of the displaced entry.
    pub key: K,
    /// Why it was displaced.
    pub reason: EvictionReason,
}

/// LRU map holding at most `capacity` entries.
///
/// Every value that leaves the map, by overflow, replacement, `remove` or
/// `clear`, reaches the eviction callback exactly once.
pub struct BoundedImageCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + 'static,
{
    name: String,
    map: Mutex<LruCache<K, V>>,
    evictions: EvictionQueue<V>,
}

impl<K, V> BoundedImageCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + 'static,
{
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(
        name: &str,
        capacity: usize,
        on_evict: EvictionCallback<V>,
    ) -> Result<Self, SchedulerError> {
        let evictions = EvictionQueue::spawn(name, on_evict)?;
        debug!(name, capacity, "Initialized bounded cache");

        Ok(Self {
            name: name.to_owned(),
            map: Mutex::new(LruCache::new(non_zero(capacity))),
            evictions,
        })
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.lock().get(key).cloned()
    }

    /// Look up `key` without touching the recency order.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.map.lock().peek(key).cloned()
    }

    /// Membership test; does not touch the recency order.
    pub fn contains(&self, key: &K) -> bool {
        self.map.lock().contains(key)
    }

    /// Insert `value`; the displaced entry, if any, goes to the eviction callback.
    pub fn put(&self, key: K, value: V) -> Option<Eviction<K>> {
        let displaced = {
            let mut map = self.map.lock();
            let replacing = map.contains(&key);
            map.push(key.clone(), value).map(|(old_key, old_value)| {
                let reason = if replacing && old_key == key {
                    EvictionReason::Replaced
                } else {
                    EvictionReason::Capacity
                };
                (old_key, old_value, reason)
            })
        };

        displaced.map(|(old_key, old_value, reason)| {
            trace!(cache = %self.name, ?reason, "Evicting cache entry");
            self.evictions.submit(old_value);
            Eviction {
                key: old_key,
                reason,
            }
        })
    }

    /// Insert `value` unless `key` is already present; returns the cached value.
    pub fn put_if_absent(&self, key: K, value: V) -> V {
        let displaced = {
            let mut map = self.map.lock();
            if let Some(existing) = map.get(&key) {
                return existing.clone();
            }
            map.push(key, value.clone())
        };
        if let Some((_, old_value)) = displaced {
            self.evictions.submit(old_value);
        }
        value
    }

    /// Remove a single entry.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.map.lock().pop(key);
        match removed {
            Some(value) => {
                self.evictions.submit(value);
                true
            }
            None => false,
        }
    }

    /// Change the bound; shrinking evicts the oldest entries first.
    pub fn resize(&self, capacity: usize) -> Vec<K> {
        let capacity = non_zero(capacity);
        let removed = {
            let mut map = self.map.lock();
            let mut removed = Vec::new();
            while map.len() > capacity.get() {
                match map.pop_lru() {
                    Some(entry) => removed.push(entry),
                    None => break,
                }
            }
            map.resize(capacity);
            removed
        };

        debug!(cache = %self.name, capacity = capacity.get(), evicted = removed.len(), "Resized cache");
        self.release(removed)
    }

    /// Remove every entry matching `predicate`; returns the removed keys.
    pub fn clear<F>(&self, mut predicate: F) -> Vec<K>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let removed = {
            let mut map = self.map.lock();
            let keys: Vec<K> = map
                .iter()
                .filter(|(k, v)| predicate(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| map.pop(&k).map(|v| (k, v)))
                .collect::<Vec<_>>()
        };

        debug!(cache = %self.name, removed = removed.len(), "Cleared cache entries");
        self.release(removed)
    }

    /// Remove every entry.
    pub fn clear_all(&self) -> Vec<K> {
        self.clear(|_, _| true)
    }

    fn release(&self, removed: Vec<(K, V)>) -> Vec<K> {
        removed
            .into_iter()
            .map(|(key, value)| {
                self.evictions.submit(value);
                key
            })
            .collect()
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// True when no entry is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bound.
    pub fn capacity(&self) -> usize {
        self.map.lock().cap().get()
    }

    /// Block until every eviction callback issued so far has run.
    pub fn flush_evictions(&self) {
        self.evictions.flush();
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

impl<K, V> std::fmt::Debug for BoundedImageCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.map.lock();
        f.debug_struct("BoundedImageCache")
            .field("name", &self.name)
            .field("len", &map.len())
            .field("capacity", &map.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    fn cache(capacity: usize) -> (BoundedImageCache<&'static str, u32>, Arc<PlMutex<Vec<u32>>>) {
        let evicted = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache =
            BoundedImageCache::new("test", capacity, Arc::new(move |v| sink.lock().push(v))).unwrap();
        (cache, evicted)
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (cache, evicted) = cache(2);
        assert!(cache.put("A", 1).is_none());
        assert!(cache.put("B", 2).is_none());
        assert_eq!(cache.get(&"B"), Some(2));

        let eviction = cache.put("C", 3).unwrap();
        assert_eq!(eviction.key, "A");
        assert_eq!(eviction.reason, EvictionReason::Capacity);

        cache.flush_evictions();
        assert_eq!(*evicted.lock(), vec![1]);
        assert!(cache.contains(&"B"));
        assert!(cache.contains(&"C"));
    }

    #[test]
    fn test_get_touches_recency() {
        let (cache, _) = cache(2);
        cache.put("A", 1);
        cache.put("B", 2);
        cache.get(&"A");

        let eviction = cache.put("C", 3).unwrap();
        assert_eq!(eviction.key, "B");
    }

    #[test]
    fn test_peek_does_not_touch() {
        let (cache, _) = cache(2);
        cache.put("A", 1);
        cache.put("B", 2);
        assert_eq!(cache.peek(&"A"), Some(1));

        assert_eq!(cache.put("C", 3).unwrap().key, "A");
    }

    #[test]
    fn test_replace_hands_old_value_to_callback() {
        let (cache, evicted) = cache(2);
        cache.put("A", 1);
        let eviction = cache.put("A", 10).unwrap();
        assert_eq!(eviction.reason, EvictionReason::Replaced);
        assert_eq!(cache.get(&"A"), Some(10));
        assert_eq!(cache.len(), 1);

        cache.flush_evictions();
        assert_eq!(*evicted.lock(), vec![1]);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let (cache, evicted) = cache(3);
        for i in 0..20u32 {
            cache.put(Box::leak(format!("k{}", i).into_boxed_str()), i);
            assert!(cache.len() <= 3);
        }
        cache.flush_evictions();
        assert_eq!(evicted.lock().len(), 20 - 3);
    }

    #[test]
    fn test_resize_shrinks_oldest_first() {
        let (cache, evicted) = cache(4);
        for (k, v) in [("A", 1), ("B", 2), ("C", 3), ("D", 4)] {
            cache.put(k, v);
        }

        let removed = cache.resize(2);
        assert_eq!(removed, vec!["A", "B"]);
        assert_eq!(cache.capacity(), 2);
        assert_eq!(cache.len(), 2);

        cache.flush_evictions();
        assert_eq!(*evicted.lock(), vec![1, 2]);

        cache.resize(5);
        cache.put("E", 5);
        cache.put("F", 6);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_clear_with_predicate() {
        let (cache, evicted) = cache(10);
        for (k, v) in [("a/1", 1), ("a/2", 2), ("b/1", 3)] {
            cache.put(k, v);
        }

        let mut removed = cache.clear(|k, _| k.starts_with("a/"));
        removed.sort_unstable();
        assert_eq!(removed, vec!["a/1", "a/2"]);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.clear_all(), vec!["b/1"]);
        assert!(cache.is_empty());

        cache.flush_evictions();
        let mut evicted = evicted.lock().clone();
        evicted.sort_unstable();
        assert_eq!(evicted, vec![1, 2, 3]);
    }

    #[test]
    fn test_remove() {
        let (cache, evicted) = cache(2);
        cache.put("A", 1);
        assert!(cache.remove(&"A"));
        assert!(!cache.remove(&"A"));
        cache.flush_evictions();
        assert_eq!(*evicted.lock(), vec![1]);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let (cache, _) = cache(0);
        cache.put("A", 1);
        cache.put("B", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.capacity(), 1);
    }
}
