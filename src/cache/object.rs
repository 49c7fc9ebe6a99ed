//! Bounded path-keyed object cache.
//!
//! Used for photo records and metadata blocks. Listeners registered with
//! [`ObjectCache::add_listener`] are told about every removal on the
//! eviction thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::bounded::BoundedImageCache;
use crate::error::SchedulerError;

/// Listener invoked once per removed entry.
pub type EvictionListener<V> = Arc<dyn Fn(&Path, &V) + Send + Sync>;

pub struct ObjectCache<V: Clone + Send + Sync + 'static> {
    inner: BoundedImageCache<PathBuf, (PathBuf, V)>,
    listeners: Arc<RwLock<Vec<EvictionListener<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> ObjectCache<V> {
    pub fn new(name: &str, capacity: usize) -> Result<Self, SchedulerError> {
        let listeners: Arc<RwLock<Vec<EvictionListener<V>>>> = Arc::new(RwLock::new(Vec::new()));
        let notify = Arc::clone(&listeners);

        let inner = BoundedImageCache::new(
            name,
            capacity,
            Arc::new(move |(path, value): (PathBuf, V)| {
                for listener in notify.read().iter() {
                    listener(&path, &value);
                }
            }),
        )?;

        Ok(Self { inner, listeners })
    }

    pub fn add_listener(&self, listener: EvictionListener<V>) {
        self.listeners.write().push(listener);
    }

    pub fn get(&self, path: &Path) -> Option<V> {
        self.inner.get(&path.to_path_buf()).map(|(_, value)| value)
    }

    /// Insert or replace; a replaced or evicted value reaches the listeners.
    pub fn put(&self, path: &Path, value: V) {
        let path = path.to_path_buf();
        self.inner.put(path.clone(), (path, value));
    }

    /// Return the cached value, creating it with `create` when absent.
    ///
    /// Two racing callers may both run `create`; the first insert wins and
    /// both get the winner back.
    pub fn get_or_insert_with<F>(&self, path: &Path, create: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(path) {
            return value;
        }
        let key = path.to_path_buf();
        let (_, value) = self.inner.put_if_absent(key.clone(), (key, create()));
        value
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.inner.remove(&path.to_path_buf())
    }

    /// Remove every entry whose path matches `predicate`.
    pub fn clear<F>(&self, mut predicate: F) -> Vec<PathBuf>
    where
        F: FnMut(&Path) -> bool,
    {
        self.inner.clear(|path, _| predicate(path))
    }

    pub fn clear_all(&self) -> Vec<PathBuf> {
        self.inner.clear_all()
    }

    pub fn resize(&self, capacity: usize) -> Vec<PathBuf> {
        self.inner.resize(capacity)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Wait until all listener notifications issued so far have run.
    pub fn flush(&self) {
        self.inner.flush_evictions();
    }
}

impl<V: Clone + Send + Sync + 'static> std::fmt::Debug for ObjectCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listeners_see_evictions() {
        let cache: ObjectCache<u32> = ObjectCache::new("objects", 2).unwrap();
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(0usize));

        let sink = Arc::clone(&first);
        cache.add_listener(Arc::new(move |path: &Path, value: &u32| {
            sink.lock().push((path.to_path_buf(), *value));
        }));
        let counter = Arc::clone(&second);
        cache.add_listener(Arc::new(move |_: &Path, _: &u32| *counter.lock() += 1));

        cache.put(Path::new("/a"), 1);
        cache.put(Path::new("/b"), 2);
        cache.put(Path::new("/c"), 3);
        cache.flush();

        assert_eq!(*first.lock(), vec![(PathBuf::from("/a"), 1)]);
        assert_eq!(*second.lock(), 1);
        assert_eq!(cache.get(Path::new("/a")), None);
        assert_eq!(cache.get(Path::new("/c")), Some(3));
    }

    #[test]
    fn test_get_or_insert_with_creates_once() {
        let cache: ObjectCache<Arc<String>> = ObjectCache::new("objects", 4).unwrap();
        let mut calls = 0;

        let a = cache.get_or_insert_with(Path::new("/a"), || {
            calls += 1;
            Arc::new("a".to_owned())
        });
        let b = cache.get_or_insert_with(Path::new("/a"), || {
            calls += 1;
            Arc::new("other".to_owned())
        });

        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_clear_by_folder() {
        let cache: ObjectCache<u32> = ObjectCache::new("objects", 10).unwrap();
        let removed = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&removed);
        cache.add_listener(Arc::new(move |_: &Path, _: &u32| *sink.lock() += 1));

        cache.put(Path::new("/one/a.jpg"), 1);
        cache.put(Path::new("/one/b.jpg"), 2);
        cache.put(Path::new("/two/c.jpg"), 3);

        let cleared = cache.clear(|path| path.starts_with("/one"));
        assert_eq!(cleared.len(), 2);
        assert_eq!(cache.len(), 1);

        cache.flush();
        assert_eq!(*removed.lock(), 2);
    }

    #[test]
    fn test_resize() {
        let cache: ObjectCache<u32> = ObjectCache::new("objects", 3).unwrap();
        for (i, p) in ["/a", "/b", "/c"].iter().enumerate() {
            cache.put(Path::new(p), i as u32);
        }
        assert_eq!(cache.resize(1), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.remove(Path::new("/c")));
        assert!(cache.is_empty());
    }
}
