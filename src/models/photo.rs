use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::quality::{GalleryItem, ImageQuality, LoadingState};
use crate::loader::Tier;

/// Geographic position read from the photo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// Decoded metadata block. Filled once and immutable until the file is replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoMetadata {
    /// Capture time in ms since the epoch, `None` when the file carries none.
    pub capture_time_ms: Option<i64>,
    pub width: u32,
    pub height: u32,
    /// EXIF orientation (1..=8), 1 when unknown.
    pub orientation: u16,
    pub gps: Option<GeoPosition>,
    pub camera: Option<String>,
    pub lens: Option<String>,
    pub focal_length: Option<f32>,
}

/// File system facts about the photo file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    /// Last modified in ms since the epoch.
    pub modified_ms: i64,
    pub available: bool,
}

impl FileInfo {
    pub fn read(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let modified_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                Self {
                    size: meta.len(),
                    modified_ms,
                    available: true,
                }
            }
            Err(e) => {
                debug!(?path, error = %e, "Photo file is not available");
                Self {
                    size: 0,
                    modified_ms: 0,
                    available: false,
                }
            }
        }
    }
}

/// One record per distinct image file path.
pub struct PhotoRecord {
    path: PathBuf,
    key: String,
    file_name: String,
    file: RwLock<FileInfo>,
    metadata: RwLock<Option<Arc<PhotoMetadata>>>,
    /// Indexed by `Tier::index`; each tier only touches its own slot.
    states: [AtomicU8; Tier::COUNT],
}

impl PhotoRecord {
    /// Create a record from the file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let info = FileInfo::read(&path);
        Self::with_file_info(path, info)
    }

    /// Create a record without touching the file system.
    pub fn detached(path: impl Into<PathBuf>) -> Self {
        Self::with_file_info(
            path.into(),
            FileInfo {
                size: 0,
                modified_ms: 0,
                available: true,
            },
        )
    }

    pub fn with_file_info(path: PathBuf, info: FileInfo) -> Self {
        let key = path.to_string_lossy().into_owned();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.clone());
        let initial = initial_state(&info) as u8;

        Self {
            path,
            key,
            file_name,
            file: RwLock::new(info),
            metadata: RwLock::new(None),
            states: std::array::from_fn(|_| AtomicU8::new(initial)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_info(&self) -> FileInfo {
        *self.file.read()
    }

    pub fn metadata(&self) -> Option<Arc<PhotoMetadata>> {
        self.metadata.read().clone()
    }

    pub fn is_metadata_loaded(&self) -> bool {
        self.metadata.read().is_some()
    }

    /// Memoize the metadata block. Returns false (and keeps the existing block)
    /// when one is already set.
    pub fn set_metadata(&self, metadata: Arc<PhotoMetadata>) -> bool {
        let mut slot = self.metadata.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(metadata);
        true
    }

    pub fn has_gps(&self) -> bool {
        self.metadata
            .read()
            .as_ref()
            .is_some_and(|m| m.gps.is_some())
    }

    /// Time used for date sorting: capture time, or file mtime until the
    /// metadata is loaded.
    pub fn sort_time_ms(&self) -> i64 {
        self.metadata
            .read()
            .as_ref()
            .and_then(|m| m.capture_time_ms)
            .unwrap_or_else(|| self.file.read().modified_ms)
    }

    pub fn loading_state(&self, quality: ImageQuality) -> LoadingState {
        self.state(Tier::from(quality))
    }

    pub fn metadata_loading_state(&self) -> LoadingState {
        self.state(Tier::Metadata)
    }

    /// True when any quality has been marked invalid.
    pub fn is_loading_error(&self) -> bool {
        ImageQuality::ALL
            .iter()
            .any(|q| self.loading_state(*q) == LoadingState::Invalid)
    }

    pub(crate) fn state(&self, tier: Tier) -> LoadingState {
        LoadingState::from_u8(self.states[tier.index()].load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, tier: Tier, state: LoadingState) {
        self.states[tier.index()].store(state as u8, Ordering::Release);
    }

    /// Move the slot to `InQueue` unless it is already there.
    pub(crate) fn try_mark_in_queue(&self, tier: Tier) -> bool {
        let slot = &self.states[tier.index()];
        let mut current = slot.load(Ordering::Acquire);
        loop {
            if current == LoadingState::InQueue as u8 {
                return false;
            }
            match slot.compare_exchange_weak(
                current,
                LoadingState::InQueue as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reset a slot that was left `InQueue` so the item can be requested again.
    pub(crate) fn reset_if_in_queue(&self, tier: Tier) {
        let _ = self.states[tier.index()].compare_exchange(
            LoadingState::InQueue as u8,
            LoadingState::Undefined as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Reset a slot that was marked invalid.
    pub(crate) fn reset_if_invalid(&self, tier: Tier) -> bool {
        self.states[tier.index()]
            .compare_exchange(
                LoadingState::Invalid as u8,
                LoadingState::Undefined as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// The file behind this record changed: re-read file facts, forget the
    /// metadata block and make every tier loadable again.
    pub fn replace_file(&self) {
        let info = FileInfo::read(&self.path);
        *self.file.write() = info;
        *self.metadata.write() = None;

        let state = initial_state(&info);
        for tier in Tier::ALL {
            self.set_state(tier, state);
        }
        trace!(path = ?self.path, available = info.available, "Replaced photo file");
    }
}

fn initial_state(info: &FileInfo) -> LoadingState {
    if info.available {
        LoadingState::Undefined
    } else {
        LoadingState::Invalid
    }
}

impl GalleryItem for PhotoRecord {
    fn unique_key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for PhotoRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoRecord")
            .field("path", &self.path)
            .field("metadata_loaded", &self.is_metadata_loaded())
            .field("thumbnail", &self.loading_state(ImageQuality::Thumbnail))
            .field("high_quality", &self.loading_state(ImageQuality::HighQuality))
            .field("original", &self.loading_state(ImageQuality::Original))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_starts_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let photo = PhotoRecord::open(dir.path().join("missing.jpg"));

        assert!(!photo.file_info().available);
        for quality in ImageQuality::ALL {
            assert_eq!(photo.loading_state(quality), LoadingState::Invalid);
        }
        assert!(photo.is_loading_error());
    }

    #[test]
    fn test_existing_file_reads_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"12345").unwrap();

        let photo = PhotoRecord::open(&path);
        let info = photo.file_info();
        assert!(info.available);
        assert_eq!(info.size, 5);
        assert!(info.modified_ms > 0);
        assert_eq!(photo.file_name(), "a.jpg");
        assert_eq!(photo.unique_key(), path.to_string_lossy());
    }

    #[test]
    fn test_in_queue_guard() {
        let photo = PhotoRecord::detached("/p1.jpg");
        assert!(photo.try_mark_in_queue(Tier::Thumbnail));
        assert!(!photo.try_mark_in_queue(Tier::Thumbnail));
        // other tiers are independent
        assert!(photo.try_mark_in_queue(Tier::Original));

        photo.reset_if_in_queue(Tier::Thumbnail);
        assert_eq!(photo.loading_state(ImageQuality::Thumbnail), LoadingState::Undefined);
        assert_eq!(photo.loading_state(ImageQuality::Original), LoadingState::InQueue);
    }

    #[test]
    fn test_reset_if_in_queue_keeps_invalid() {
        let photo = PhotoRecord::detached("/p1.jpg");
        photo.set_state(Tier::HighQuality, LoadingState::Invalid);
        photo.reset_if_in_queue(Tier::HighQuality);
        assert_eq!(photo.loading_state(ImageQuality::HighQuality), LoadingState::Invalid);

        assert!(photo.reset_if_invalid(Tier::HighQuality));
        assert_eq!(photo.loading_state(ImageQuality::HighQuality), LoadingState::Undefined);
    }

    #[test]
    fn test_metadata_is_memoized() {
        let photo = PhotoRecord::detached("/p1.jpg");
        let first = Arc::new(PhotoMetadata {
            width: 10,
            ..Default::default()
        });
        let second = Arc::new(PhotoMetadata {
            width: 20,
            ..Default::default()
        });

        assert!(photo.set_metadata(first));
        assert!(!photo.set_metadata(second));
        assert_eq!(photo.metadata().unwrap().width, 10);
    }

    #[test]
    fn test_sort_time_prefers_capture_time() {
        let photo = PhotoRecord::with_file_info(
            "/p1.jpg".into(),
            FileInfo {
                size: 1,
                modified_ms: 5_000,
                available: true,
            },
        );
        assert_eq!(photo.sort_time_ms(), 5_000);

        photo.set_metadata(Arc::new(PhotoMetadata {
            capture_time_ms: Some(1_000),
            ..Default::default()
        }));
        assert_eq!(photo.sort_time_ms(), 1_000);
    }

    #[test]
    fn test_replace_file_clears_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"1").unwrap();

        let photo = PhotoRecord::open(&path);
        photo.set_metadata(Arc::new(PhotoMetadata::default()));
        photo.set_state(Tier::Thumbnail, LoadingState::Invalid);

        std::fs::write(&path, b"123").unwrap();
        photo.replace_file();

        assert!(!photo.is_metadata_loaded());
        assert_eq!(photo.file_info().size, 3);
        assert_eq!(photo.loading_state(ImageQuality::Thumbnail), LoadingState::Undefined);
    }
}
