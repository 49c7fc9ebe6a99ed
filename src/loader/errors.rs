use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

/// Sticky sets of known-bad paths.
///
/// `load_errors` short-circuits repeat decodes; `thumb_save_errors` stops
/// the scheduler from retrying a thumbnail store that already refused the
/// file. Both are cleared only by an explicit retry.
#[derive(Debug, Default)]
pub struct ErrorMemo {
    load_errors: RwLock<HashSet<PathBuf>>,
    thumb_save_errors: RwLock<HashSet<PathBuf>>,
}

impl ErrorMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_load_error(&self, path: &Path) -> bool {
        self.load_errors.read().contains(path)
    }

    pub fn record_load_error(&self, path: &Path) {
        self.load_errors.write().insert(path.to_path_buf());
    }

    pub fn is_thumb_save_error(&self, path: &Path) -> bool {
        self.thumb_save_errors.read().contains(path)
    }

    pub fn record_thumb_save_error(&self, path: &Path) {
        self.thumb_save_errors.write().insert(path.to_path_buf());
    }

    pub fn load_error_count(&self) -> usize {
        self.load_errors.read().len()
    }

    pub fn thumb_save_error_count(&self) -> usize {
        self.thumb_save_errors.read().len()
    }

    /// Forget every recorded failure. Returns the paths that had a load error.
    pub fn clear(&self) -> Vec<PathBuf> {
        let load: Vec<PathBuf> = self.load_errors.write().drain().collect();
        let saves = {
            let mut saves = self.thumb_save_errors.write();
            let count = saves.len();
            saves.clear();
            count
        };
        debug!(load_errors = load.len(), thumb_save_errors = saves, "Cleared error memo");
        load
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sets_are_independent() {
        let memo = ErrorMemo::new();
        memo.record_load_error(Path::new("/a.jpg"));
        memo.record_thumb_save_error(Path::new("/b.jpg"));

        assert!(memo.is_load_error(Path::new("/a.jpg")));
        assert!(!memo.is_load_error(Path::new("/b.jpg")));
        assert!(memo.is_thumb_save_error(Path::new("/b.jpg")));

        let cleared = memo.clear();
        assert_eq!(cleared, vec![PathBuf::from("/a.jpg")]);
        assert_eq!(memo.load_error_count(), 0);
        assert_eq!(memo.thumb_save_error_count(), 0);
    }
}
