//! Multi-tier load scheduler.
//!
//! - Four tier queues, each drained by its own worker pool
//! - Metadata and thumbnail pools scale with the machine, high-quality and
//!   original pools are single threaded
//! - `InQueue` state on the photo gives at most one pending item per tier
//! - Visibility is checked right before decoding; decodes never abort midway

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::Receiver;
use image::{DynamicImage, GenericImageView};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::decoder::{ImageCrateDecoder, ImageDecoder};
use super::errors::ErrorMemo;
use super::request::{
    AlwaysVisible, LoadCallback, LoadOutcome, LoadRequest, LoadTicket, QueueItem, VisibilityProbe,
};
use super::store::{NoThumbnailStore, ThumbnailStore};
use super::tier::{Tier, TierQueue};
use crate::cache::{CacheEntry, ObjectCache, PhotoImageCache};
use crate::config::PipelineConfig;
use crate::error::{DecodeError, SchedulerError};
use crate::models::{ImageQuality, LoadingState, PhotoMetadata, PhotoRecord};

/// How long an idle worker waits for a token before re-checking shutdown.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Snapshot of pending work per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Metadata items waiting in the queue.
    pub metadata: usize,
    /// Thumbnail decodes waiting in the queue.
    pub thumbnail: usize,
    /// High-quality decodes waiting in the queue.
    pub high_quality: usize,
    /// Original-size decodes waiting in the queue.
    pub original: usize,
    /// Workers of any tier currently processing an item.
    pub active_workers: usize,
}

impl QueueStatus {
    /// Nothing queued and no worker busy.
    pub fn is_idle(&self) -> bool {
        self.metadata + self.thumbnail + self.high_quality + self.original + self.active_workers
            == 0
    }

    /// Status line text, `None` when nothing is pending.
    pub fn describe(&self) -> Option<String> {
        let images = self.thumbnail + self.high_quality + self.original;
        if images == 0 && self.metadata == 0 {
            return None;
        }
        Some(format!(
            "Loading images: {} thumbnails, {} high-quality, {} metadata",
            self.thumbnail,
            self.high_quality + self.original,
            self.metadata
        ))
    }
}

/// State shared between the scheduler handle and its workers.
struct SchedulerShared {
    queues: [Arc<TierQueue>; Tier::COUNT],
    active: [AtomicUsize; Tier::COUNT],
    shutdown: AtomicBool,
    cache: Arc<PhotoImageCache>,
    metadata_cache: Arc<ObjectCache<Arc<PhotoMetadata>>>,
    decoder: Arc<dyn ImageDecoder>,
    store: Arc<dyn ThumbnailStore>,
    visibility: Arc<dyn VisibilityProbe>,
    errors: ErrorMemo,
    thumbnail_size: u32,
}

impl SchedulerShared {
    fn queue(&self, tier: Tier) -> &TierQueue {
        &self.queues[tier.index()]
    }

    fn request(&self, request: LoadRequest, callback: Option<LoadCallback>) -> Result<bool, SchedulerError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        let tier = request.tier();
        if !request.photo().try_mark_in_queue(tier) {
            trace!(path = ?request.photo().path(), %tier, "Request already pending");
            return Ok(false);
        }

        trace!(path = ?request.photo().path(), %tier, "Queued load request");
        self.queue(tier).push(QueueItem::new(request, callback));
        Ok(true)
    }

    fn cancel(&self, tier: Tier) -> usize {
        let drained = self.queue(tier).drain();
        for item in &drained {
            item.photo().reset_if_in_queue(tier);
        }
        drained.len()
    }

    fn process(&self, item: QueueItem) {
        let request = item.request();
        let photo = request.photo();
        let tier = request.tier();

        if self.errors.is_load_error(photo.path()) {
            trace!(path = ?photo.path(), %tier, "Skipping path with earlier load error");
            let error = DecodeError::PreviouslyFailed {
                path: photo.path().to_path_buf(),
            };
            self.fail(&item, error);
            return;
        }

        if request.is_visibility_gated() && !self.visibility.is_visible(request.visibility_key()) {
            trace!(path = ?photo.path(), %tier, "Item no longer visible, skipping");
            photo.reset_if_in_queue(tier);
            return;
        }

        match tier.quality() {
            Some(quality) => self.load_image(&item, quality),
            None => self.load_metadata(&item),
        }
    }

    fn load_image(&self, item: &QueueItem, quality: ImageQuality) {
        let request = item.request();
        let photo = request.photo();
        let path = photo.path();

        let stored = match quality {
            ImageQuality::Thumbnail => self.store.load(photo),
            _ => None,
        };
        let from_store = stored.is_some();

        let image = match stored {
            Some(image) => image,
            None => match self.decode(path, quality, request.size_hint()) {
                Ok(image) => image,
                Err(e) => {
                    self.fail(item, e);
                    return;
                }
            },
        };

        if quality == ImageQuality::Thumbnail && !from_store {
            self.save_thumbnail(photo, &image);
        }

        let (width, height) = image.dimensions();
        let entry = CacheEntry::new(path.to_path_buf(), quality, image);
        self.cache.put(entry.clone());
        photo.reset_if_in_queue(request.tier());
        trace!(?path, %quality, width, height, "Loaded image");
        item.complete(LoadOutcome::Image(entry));

        if quality == ImageQuality::Thumbnail
            && needs_high_quality(request.size_hint(), width.max(height), self.thumbnail_size)
        {
            let mut cascade =
                LoadRequest::image(photo, ImageQuality::HighQuality).with_size_hint(request.size_hint());
            if request.is_visibility_gated() {
                cascade = cascade.gated_by_visibility();
            }
            trace!(?path, size_hint = request.size_hint(), "Cascading to high-quality load");
            if let Err(e) = self.request(cascade, item.callback().cloned()) {
                debug!(?path, error = %e, "Cascade dropped");
            }
        }
    }

    fn save_thumbnail(&self, photo: &PhotoRecord, image: &DynamicImage) {
        let path = photo.path();
        if self.errors.is_thumb_save_error(path) {
            return;
        }
        if let Err(e) = self.store.save(photo, image) {
            // The in-memory image is still used
            warn!(?path, error = %e, "Failed to store thumbnail");
            self.errors.record_thumb_save_error(path);
        }
    }

    fn load_metadata(&self, item: &QueueItem) {
        let photo = item.photo();
        let path = photo.path();

        let metadata = match photo.metadata() {
            Some(metadata) => metadata,
            None => match self.metadata_cache.get(path) {
                Some(metadata) => {
                    trace!(?path, "Metadata cache hit");
                    photo.set_metadata(Arc::clone(&metadata));
                    metadata
                }
                None => match self.read_metadata(path) {
                    Ok(metadata) => {
                        let metadata = Arc::new(metadata);
                        photo.set_metadata(Arc::clone(&metadata));
                        self.metadata_cache.put(path, Arc::clone(&metadata));
                        // A concurrent replace may have won; report what the photo holds.
                        photo.metadata().unwrap_or(metadata)
                    }
                    Err(e) => {
                        self.fail(item, e);
                        return;
                    }
                },
            },
        };

        photo.reset_if_in_queue(Tier::Metadata);
        item.complete(LoadOutcome::Metadata(metadata));
    }

    fn decode(&self, path: &Path, quality: ImageQuality, size_hint: u32) -> Result<DynamicImage, DecodeError> {
        guarded(path, || self.decoder.decode(path, quality, size_hint))
    }

    fn read_metadata(&self, path: &Path) -> Result<PhotoMetadata, DecodeError> {
        guarded(path, || self.decoder.read_metadata(path))
    }

    fn fail(&self, item: &QueueItem, error: DecodeError) {
        let tier = item.request().tier();
        let path = item.photo().path();

        match &error {
            DecodeError::PreviouslyFailed { .. } => {}
            DecodeError::Panicked { .. } => {
                error!(?path, %tier, error = %error, "Decoder panicked");
                self.errors.record_load_error(path);
            }
            _ => {
                warn!(?path, %tier, error = %error, "Failed to load");
                self.errors.record_load_error(path);
            }
        }

        item.photo().set_state(tier, LoadingState::Invalid);
        item.complete(LoadOutcome::Failed {
            tier,
            error: Arc::new(error),
        });
    }
}

/// Run a decoder call, turning a panic into a decode failure for this item.
fn guarded<T, F>(path: &Path, f: F) -> Result<T, DecodeError>
where
    F: FnOnce() -> Result<T, DecodeError>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(DecodeError::Panicked {
            path: path.to_path_buf(),
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// A thumbnail is not enough when the view wants more pixels than a
/// thumbnail carries and the decode came out smaller than asked for.
fn needs_high_quality(size_hint: u32, longest_side: u32, thumbnail_size: u32) -> bool {
    size_hint > thumbnail_size && longest_side < size_hint
}

/// Worker thread loop.
fn worker_loop(worker_id: usize, tier: Tier, tokens: Receiver<()>, shared: Arc<SchedulerShared>) {
    debug!(worker_id, %tier, "Load worker started");

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        match tokens.recv_timeout(WORKER_POLL) {
            Ok(()) => {
                // Counted before the pop so an item is never invisible to `is_idle`.
                let active = &shared.active[tier.index()];
                active.fetch_add(1, Ordering::AcqRel);
                // The item may already be gone if the queue was drained.
                if let Some(item) = shared.queue(tier).pop() {
                    shared.process(item);
                }
                active.fetch_sub(1, Ordering::AcqRel);
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker_id, %tier, "Load worker stopped");
}

/// Scheduler handle. Dropping it stops and joins every worker.
pub struct LoadScheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LoadScheduler {
    /// Start configuring a scheduler.
    pub fn builder() -> LoadSchedulerBuilder {
        LoadSchedulerBuilder::new()
    }

    fn spawn_pool(&self, tier: Tier, size: usize) -> Result<(), SchedulerError> {
        let mut workers = self.workers.lock();
        for worker_id in 0..size {
            let tokens = self.shared.queue(tier).tokens();
            let shared = Arc::clone(&self.shared);
            let name = tier.thread_name(worker_id);

            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(worker_id, tier, tokens, shared))
                .map_err(|source| SchedulerError::Spawn { name, source })?;
            workers.push(handle);
        }
        debug!(%tier, size, "Started load worker pool");
        Ok(())
    }

    /// Queue a request. Returns `Ok(false)` when the photo already has a
    /// pending item for that tier.
    pub fn request(
        &self,
        request: LoadRequest,
        callback: Option<LoadCallback>,
    ) -> Result<bool, SchedulerError> {
        self.shared.request(request, callback)
    }

    /// Queue an image load with a completion callback.
    pub fn request_load(
        &self,
        photo: &Arc<PhotoRecord>,
        quality: ImageQuality,
        callback: LoadCallback,
    ) -> Result<bool, SchedulerError> {
        self.request(LoadRequest::image(photo, quality), Some(callback))
    }

    /// Queue a metadata read. The callback is optional; the metadata is
    /// memoized on the photo either way.
    pub fn request_metadata(
        &self,
        photo: &Arc<PhotoRecord>,
        callback: Option<LoadCallback>,
    ) -> Result<bool, SchedulerError> {
        self.request(LoadRequest::metadata(photo), callback)
    }

    /// Queue a request and get a ticket for its outcome. `None` when the
    /// photo already has a pending item for that tier.
    pub fn load(&self, request: LoadRequest) -> Result<Option<LoadTicket>, SchedulerError> {
        let (ticket, callback) = LoadTicket::pair();
        Ok(self.request(request, Some(callback))?.then_some(ticket))
    }

    /// Drop every queued item that has not started. Running decodes finish.
    /// Dropped items are reset to `Undefined`; their callbacks never run.
    pub fn cancel_all(&self, clear_metadata: bool) -> usize {
        let mut cancelled = 0;
        for tier in Tier::ALL {
            if tier == Tier::Metadata && !clear_metadata {
                continue;
            }
            cancelled += self.shared.cancel(tier);
        }
        debug!(cancelled, clear_metadata, "Cancelled queued loads");
        cancelled
    }

    /// Items of `tier` waiting for a worker. Running items are not counted.
    pub fn queue_depth(&self, tier: Tier) -> usize {
        self.shared.queue(tier).len()
    }

    /// Workers of all tiers currently processing an item.
    pub fn active_workers(&self) -> usize {
        self.shared
            .active
            .iter()
            .map(|a| a.load(Ordering::Acquire))
            .sum()
    }

    /// Workers of `tier` currently processing an item.
    pub fn active_in(&self, tier: Tier) -> usize {
        self.shared.active[tier.index()].load(Ordering::Acquire)
    }

    /// Snapshot of every queue depth plus the busy worker count.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            metadata: self.queue_depth(Tier::Metadata),
            thumbnail: self.queue_depth(Tier::Thumbnail),
            high_quality: self.queue_depth(Tier::HighQuality),
            original: self.queue_depth(Tier::Original),
            active_workers: self.active_workers(),
        }
    }

    /// True when every queue is empty and no worker is busy.
    pub fn is_idle(&self) -> bool {
        self.status().is_idle()
    }

    /// Clear both sticky error sets and make invalid photos loadable again.
    pub fn retry_invalid<'a, I>(&self, photos: I) -> usize
    where
        I: IntoIterator<Item = &'a Arc<PhotoRecord>>,
    {
        self.shared.errors.clear();
        let mut reset = 0;
        for photo in photos {
            for tier in Tier::ALL {
                if photo.reset_if_invalid(tier) {
                    reset += 1;
                }
            }
        }
        debug!(reset, "Reset invalid photo states");
        reset
    }

    /// Sticky load and thumbnail-save error sets.
    pub fn errors(&self) -> &ErrorMemo {
        &self.shared.errors
    }

    /// Decoded image cache the workers fill.
    pub fn cache(&self) -> &Arc<PhotoImageCache> {
        &self.shared.cache
    }

    /// Metadata blocks keyed by path.
    pub fn metadata_cache(&self) -> &Arc<ObjectCache<Arc<PhotoMetadata>>> {
        &self.shared.metadata_cache
    }

    /// True once `shutdown` ran; requests are rejected from then on.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work, drop everything queued and join the workers.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutting down load scheduler");

        for tier in Tier::ALL {
            self.shared.cancel(tier);
        }

        // The last handle may be dropped from a completion callback.
        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        debug!("Load scheduler shutdown complete");
    }
}

impl Drop for LoadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LoadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadScheduler")
            .field("status", &self.status())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Builder for LoadScheduler with configuration options.
pub struct LoadSchedulerBuilder {
    config: PipelineConfig,
    decoder: Option<Arc<dyn ImageDecoder>>,
    store: Arc<dyn ThumbnailStore>,
    visibility: Arc<dyn VisibilityProbe>,
    cache: Option<Arc<PhotoImageCache>>,
    metadata_cache: Option<Arc<ObjectCache<Arc<PhotoMetadata>>>>,
}

impl LoadSchedulerBuilder {
    /// Defaults: `PipelineConfig::default()`, the `image`-crate decoder, no
    /// thumbnail store, everything visible.
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            decoder: None,
            store: Arc::new(NoThumbnailStore),
            visibility: Arc::new(AlwaysVisible),
            cache: None,
            metadata_cache: None,
        }
    }

    /// Pool sizes, cache capacities and decode sizes. The config is normalized.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Replace the `image`-crate decoder.
    pub fn decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Where thumbnails are looked up before decoding and saved after.
    pub fn thumbnail_store(mut self, store: Arc<dyn ThumbnailStore>) -> Self {
        self.store = store;
        self
    }

    /// Probe consulted before decoding visibility-gated requests.
    pub fn visibility(mut self, visibility: Arc<dyn VisibilityProbe>) -> Self {
        self.visibility = visibility;
        self
    }

    /// Share an existing image cache instead of creating one from the config.
    pub fn image_cache(mut self, cache: Arc<PhotoImageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share an existing metadata cache instead of creating one from the config.
    pub fn metadata_cache(mut self, cache: Arc<ObjectCache<Arc<PhotoMetadata>>>) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    /// Create the caches that were not supplied and start every worker pool.
    pub fn build(self) -> Result<LoadScheduler, SchedulerError> {
        let config = self.config;

        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(PhotoImageCache::new(
                config.thumbnail_cache_capacity,
                config.original_cache_capacity,
            )?),
        };
        let metadata_cache = match self.metadata_cache {
            Some(cache) => cache,
            None => Arc::new(ObjectCache::new("metadata", config.metadata_cache_capacity)?),
        };
        let decoder = self.decoder.unwrap_or_else(|| {
            Arc::new(ImageCrateDecoder::new(config.thumbnail_size, config.hq_image_size))
        });

        let shared = Arc::new(SchedulerShared {
            queues: Tier::ALL.map(TierQueue::new),
            active: std::array::from_fn(|_| AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
            cache,
            metadata_cache,
            decoder,
            store: self.store,
            visibility: self.visibility,
            errors: ErrorMemo::new(),
            thumbnail_size: config.thumbnail_size,
        });

        let scheduler = LoadScheduler {
            shared,
            workers: Mutex::new(Vec::new()),
        };
        // On a spawn failure the partially built scheduler is dropped, which
        // joins the workers started so far.
        scheduler.spawn_pool(Tier::Metadata, config.metadata_pool_size())?;
        scheduler.spawn_pool(Tier::Thumbnail, config.thumbnail_pool_size())?;
        scheduler.spawn_pool(Tier::HighQuality, 1)?;
        scheduler.spawn_pool(Tier::Original, 1)?;

        Ok(scheduler)
    }
}

impl Default for LoadSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
