use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use super::photo::PhotoRecord;
use crate::cache::{EvictionListener, ObjectCache};
use crate::error::SchedulerError;

/// Bounded set of photo records keyed by file path.
///
/// Records are created lazily the first time a path is seen. Evicting a
/// record notifies the listeners so owners of secondary caches can drop
/// what they hold for that photo.
pub struct PhotoRegistry {
    photos: ObjectCache<Arc<PhotoRecord>>,
}

impl PhotoRegistry {
    pub fn new(capacity: usize) -> Result<Self, SchedulerError> {
        Ok(Self {
            photos: ObjectCache::new("photos", capacity)?,
        })
    }

    pub fn get(&self, path: &Path) -> Option<Arc<PhotoRecord>> {
        self.photos.get(path)
    }

    pub fn get_or_create(&self, path: &Path) -> Arc<PhotoRecord> {
        self.photos.get_or_insert_with(path, || {
            trace!(?path, "Creating photo record");
            Arc::new(PhotoRecord::open(path))
        })
    }

    pub fn add_listener(&self, listener: EvictionListener<Arc<PhotoRecord>>) {
        self.photos.add_listener(listener);
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.photos.remove(path)
    }

    pub fn resize(&self, capacity: usize) {
        self.photos.resize(capacity);
    }

    pub fn clear(&self) {
        self.photos.clear_all();
    }

    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }

    pub fn flush(&self) {
        self.photos.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[test]
    fn test_same_path_same_record() {
        let registry = PhotoRegistry::new(10).unwrap();
        let a = registry.get_or_create(Path::new("/photos/a.jpg"));
        let b = registry.get_or_create(Path::new("/photos/a.jpg"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_eviction_notifies_listener() {
        let registry = PhotoRegistry::new(1).unwrap();
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        registry.add_listener(Arc::new(move |path: &Path, _: &Arc<PhotoRecord>| {
            sink.lock().push(path.to_path_buf());
        }));

        registry.get_or_create(Path::new("/photos/a.jpg"));
        registry.get_or_create(Path::new("/photos/b.jpg"));
        registry.flush();

        assert_eq!(*evicted.lock(), vec![PathBuf::from("/photos/a.jpg")]);
        assert!(registry.get(Path::new("/photos/a.jpg")).is_none());
    }
}
