//! Decoded image cache.
//!
//! Two bounded caches with independent capacities: one shared by thumbnails
//! and high-quality images, one for originals. Keys are xxhash of the path
//! plus the quality tag, so every quality of a photo gets its own entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use super::bounded::{BoundedImageCache, Eviction};
use super::eviction::EvictionCallback;
use crate::error::SchedulerError;
use crate::models::{ImageQuality, PhotoRecord};

/// Cache key for image lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    pub fn new(path: &Path, quality: ImageQuality) -> Self {
        let path_str = path.to_string_lossy();
        let tag = quality.cache_tag();
        let mut data = Vec::with_capacity(path_str.len() + tag.len());
        data.extend_from_slice(path_str.as_bytes());
        data.extend_from_slice(tag.as_bytes());
        Self(xxh3_64(&data))
    }

    pub fn hash(&self) -> u64 {
        self.0
    }
}

/// A cached decoded image.
#[derive(Clone)]
pub struct CacheEntry {
    pub image: Arc<DynamicImage>,
    pub width: u32,
    pub height: u32,
    pub path: PathBuf,
    pub quality: ImageQuality,
}

impl CacheEntry {
    pub fn new(path: PathBuf, quality: ImageQuality, image: DynamicImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            image: Arc::new(image),
            width,
            height,
            path,
            quality,
        }
    }

    /// Estimated memory held by the pixel buffer.
    pub fn memory_bytes(&self) -> usize {
        self.image.as_bytes().len()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("path", &self.path)
            .field("quality", &self.quality)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// The two bounded caches behind [`PhotoImageCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Thumbnails and high-quality images.
    Thumbnail,
    Original,
}

impl CacheTier {
    pub fn for_quality(quality: ImageQuality) -> Self {
        match quality {
            ImageQuality::Thumbnail | ImageQuality::HighQuality => Self::Thumbnail,
            ImageQuality::Original => Self::Original,
        }
    }
}

pub struct PhotoImageCache {
    thumbnails: BoundedImageCache<CacheKey, CacheEntry>,
    originals: BoundedImageCache<CacheKey, CacheEntry>,
}

impl PhotoImageCache {
    /// Create the cache; evicted images are dropped on the eviction threads.
    pub fn new(thumbnail_capacity: usize, original_capacity: usize) -> Result<Self, SchedulerError> {
        Self::with_eviction_callback(
            thumbnail_capacity,
            original_capacity,
            Arc::new(|entry: CacheEntry| {
                trace!(path = ?entry.path, quality = %entry.quality, "Released cached image");
            }),
        )
    }

    /// Create the cache with a callback that receives every removed entry.
    pub fn with_eviction_callback(
        thumbnail_capacity: usize,
        original_capacity: usize,
        on_evict: EvictionCallback<CacheEntry>,
    ) -> Result<Self, SchedulerError> {
        let thumbnails =
            BoundedImageCache::new("thumbnails", thumbnail_capacity, Arc::clone(&on_evict))?;
        let originals = BoundedImageCache::new("originals", original_capacity, on_evict)?;

        debug!(thumbnail_capacity, original_capacity, "Initialized image cache");
        Ok(Self {
            thumbnails,
            originals,
        })
    }

    fn tier(&self, tier: CacheTier) -> &BoundedImageCache<CacheKey, CacheEntry> {
        match tier {
            CacheTier::Thumbnail => &self.thumbnails,
            CacheTier::Original => &self.originals,
        }
    }

    pub fn get(&self, photo: &PhotoRecord, quality: ImageQuality) -> Option<CacheEntry> {
        self.get_path(photo.path(), quality)
    }

    pub fn get_path(&self, path: &Path, quality: ImageQuality) -> Option<CacheEntry> {
        self.tier(CacheTier::for_quality(quality))
            .get(&CacheKey::new(path, quality))
    }

    pub fn contains(&self, path: &Path, quality: ImageQuality) -> bool {
        self.tier(CacheTier::for_quality(quality))
            .contains(&CacheKey::new(path, quality))
    }

    /// Insert a decoded image; a later load of the same photo/quality overwrites it.
    pub fn put(&self, entry: CacheEntry) -> Option<Eviction<CacheKey>> {
        let key = CacheKey::new(&entry.path, entry.quality);
        self.tier(CacheTier::for_quality(entry.quality))
            .put(key, entry)
    }

    pub fn resize(&self, tier: CacheTier, capacity: usize) -> usize {
        self.tier(tier).resize(capacity).len()
    }

    pub fn capacity(&self, tier: CacheTier) -> usize {
        self.tier(tier).capacity()
    }

    pub fn len(&self, tier: CacheTier) -> usize {
        self.tier(tier).len()
    }

    /// Drop every image of the photos directly inside `folder`.
    pub fn clear_folder(&self, folder: &Path) -> usize {
        self.clear_matching(|entry| entry.path.parent() == Some(folder))
    }

    /// Drop every quality of one photo.
    pub fn clear_photo(&self, path: &Path) -> usize {
        self.clear_matching(|entry| entry.path == path)
    }

    pub fn clear_all(&self) -> usize {
        self.thumbnails.clear_all().len() + self.originals.clear_all().len()
    }

    fn clear_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let removed = self.thumbnails.clear(|_, entry| predicate(entry)).len()
            + self.originals.clear(|_, entry| predicate(entry)).len();
        trace!(removed, "Cleared image cache entries");
        removed
    }

    /// Wait until every eviction issued so far has been processed.
    pub fn flush(&self) {
        self.thumbnails.flush_evictions();
        self.originals.flush_evictions();
    }
}

impl std::fmt::Debug for PhotoImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoImageCache")
            .field("thumbnails", &self.thumbnails)
            .field("originals", &self.originals)
            .finish()
    }
}
