//! On-disk thumbnail store.
//!
//! Files live in XDG_CACHE_HOME/photoload/thumbs/ and are named after the
//! xxhash of (path + mtime + size), so a changed source file simply misses.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::StoreError;
use crate::models::PhotoRecord;

/// Bump when the stored thumbnail format changes.
const STORE_VERSION: u8 = 1;

/// JPEG quality for stored thumbnails (0-100).
const JPEG_QUALITY: u8 = 85;

/// Persistent thumbnail storage consulted before decoding a thumbnail.
pub trait ThumbnailStore: Send + Sync {
    fn load(&self, photo: &PhotoRecord) -> Option<DynamicImage>;

    fn save(&self, photo: &PhotoRecord, image: &DynamicImage) -> Result<(), StoreError>;
}

/// Store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThumbnailStore;

impl ThumbnailStore for NoThumbnailStore {
    fn load(&self, _photo: &PhotoRecord) -> Option<DynamicImage> {
        None
    }

    fn save(&self, _photo: &PhotoRecord, _image: &DynamicImage) -> Result<(), StoreError> {
        Ok(())
    }
}

/// JPEG files in a cache directory.
#[derive(Debug, Clone)]
pub struct DiskThumbnailStore {
    cache_dir: PathBuf,
}

impl DiskThumbnailStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            warn!(?cache_dir, error = ?e, "Failed to create thumbnail directory");
        }
        debug!(?cache_dir, "Initialized thumbnail store");
        Self { cache_dir }
    }

    pub fn new_default() -> Result<Self, StoreError> {
        Ok(Self::new(Self::default_cache_dir()?))
    }

    pub fn default_cache_dir() -> Result<PathBuf, StoreError> {
        let dirs = ProjectDirs::from("", "", "photoload").ok_or(StoreError::NoCacheDir)?;
        Ok(dirs.cache_dir().join("thumbs"))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// File that holds the thumbnail of `photo`.
    pub fn disk_path(&self, photo: &PhotoRecord) -> PathBuf {
        let info = photo.file_info();
        let path_str = photo.path().to_string_lossy();
        let mut data = Vec::with_capacity(path_str.len() + 17);
        data.push(STORE_VERSION);
        data.extend_from_slice(path_str.as_bytes());
        data.extend_from_slice(&info.modified_ms.to_le_bytes());
        data.extend_from_slice(&info.size.to_le_bytes());
        self.cache_dir.join(format!("{:016x}.jpg", xxh3_64(&data)))
    }
}

impl ThumbnailStore for DiskThumbnailStore {
    fn load(&self, photo: &PhotoRecord) -> Option<DynamicImage> {
        let disk_path = self.disk_path(photo);
        if !disk_path.exists() {
            return None;
        }
        match image::open(&disk_path) {
            Ok(img) => {
                trace!(path = ?photo.path(), "Thumbnail store hit");
                Some(img)
            }
            Err(e) => {
                // Corrupted file, drop it so the next save replaces it
                debug!(?disk_path, error = %e, "Removing unreadable stored thumbnail");
                let _ = std::fs::remove_file(&disk_path);
                None
            }
        }
    }

    fn save(&self, photo: &PhotoRecord, image: &DynamicImage) -> Result<(), StoreError> {
        let dst = self.disk_path(photo);
        let file = File::create(&dst).map_err(|source| StoreError::Write {
            path: dst.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);

        // JPEG has no alpha channel
        let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
        image
            .to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|source| StoreError::Encode {
                path: dst.clone(),
                source,
            })?;

        trace!(?dst, "Saved thumbnail");
        Ok(())
    }
}
