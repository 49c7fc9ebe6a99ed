use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::PhotoRecord;

/// Content filter applied to a folder listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoFilter {
    #[default]
    All,
    WithGps,
    NoGps,
}

impl PhotoFilter {
    /// Photos without loaded metadata only pass `All`.
    pub fn matches(self, photo: &PhotoRecord) -> bool {
        match self {
            Self::All => true,
            Self::WithGps => photo.is_metadata_loaded() && photo.has_gps(),
            Self::NoGps => photo.is_metadata_loaded() && !photo.has_gps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GallerySorting {
    /// Capture time, file mtime until metadata is loaded.
    #[default]
    ByDate,
    /// File name, case-insensitive.
    ByName,
}

impl GallerySorting {
    pub fn compare(self, a: &PhotoRecord, b: &PhotoRecord) -> Ordering {
        match self {
            Self::ByDate => a
                .sort_time_ms()
                .cmp(&b.sort_time_ms())
                .then_with(|| compare_names(a, b)),
            Self::ByName => compare_names(a, b),
        }
    }

    pub fn sort(self, photos: &mut [Arc<PhotoRecord>]) {
        photos.sort_by(|a, b| self.compare(a, b));
    }
}

fn compare_names(a: &PhotoRecord, b: &PhotoRecord) -> Ordering {
    a.file_name()
        .to_lowercase()
        .cmp(&b.file_name().to_lowercase())
        .then_with(|| a.path().cmp(b.path()))
}

/// Filter and sort a listing into the list shown by the gallery.
pub fn apply(
    photos: &[Arc<PhotoRecord>],
    filter: PhotoFilter,
    sorting: GallerySorting,
) -> Vec<Arc<PhotoRecord>> {
    let mut filtered: Vec<Arc<PhotoRecord>> = photos
        .iter()
        .filter(|p| filter.matches(p))
        .cloned()
        .collect();
    sorting.sort(&mut filtered);
    filtered
}
