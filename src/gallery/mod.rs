//! Gallery controller.
//!
//! Ties the folder worker, the load scheduler and three debounce coalescers
//! together:
//!
//! - `filter` recomputes the filtered and sorted list. Its first run after a
//!   listing or a filter change is immediate and queues metadata for every
//!   photo lacking it; later runs are dirtied by metadata completions.
//! - `ui-filter` hands a recomputed list to the surface.
//! - `status` refreshes the status line while work is pending.
//!
//! Every callback holds a weak reference to the controller, so a dropped
//! gallery never keeps its threads busy.

pub mod filter;
pub mod surface;

pub use filter::{apply as apply_filter, GallerySorting, PhotoFilter};
pub use surface::{GallerySurface, SurfaceVisibility};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::cache::CacheEntry;
use crate::config::PipelineConfig;
use crate::debounce::DebounceCoalescer;
use crate::error::SchedulerError;
use crate::loader::{
    DiskThumbnailStore, LoadCallback, LoadOutcome, LoadRequest, LoadScheduler, QueueStatus, Tier,
};
use crate::models::{FileInfo, ImageQuality, LoadingState, PhotoRecord, PhotoRegistry};
use crate::scanner::{FileEnumerator, FolderListing, FolderWorker, WalkDirEnumerator};

#[derive(Default)]
struct GalleryState {
    folder: Option<PathBuf>,
    /// Bumped whenever a folder listing replaces `photos`.
    listing: u64,
    /// Current listing in the active sort order.
    photos: Vec<Arc<PhotoRecord>>,
    /// What the surface shows.
    filtered: Vec<Arc<PhotoRecord>>,
    /// Computed by a filter run, waiting for the ui-filter job.
    pending_ui: Option<Vec<Arc<PhotoRecord>>>,
    filter: PhotoFilter,
    sorting: GallerySorting,
    /// The next filter run is an initial one.
    initial_pending: bool,
}

/// Inputs of a filter run, taken under the state lock.
struct ListingSnapshot {
    listing: u64,
    photos: Vec<Arc<PhotoRecord>>,
    filter: PhotoFilter,
    sorting: GallerySorting,
}

impl ListingSnapshot {
    fn is_current(&self, state: &GalleryState) -> bool {
        snapshot_is_current(state, self.listing, self.filter, self.sorting)
    }
}

/// The state still holds the listing, filter and sort order a snapshot was
/// taken from.
fn snapshot_is_current(
    state: &GalleryState,
    listing: u64,
    filter: PhotoFilter,
    sorting: GallerySorting,
) -> bool {
    state.listing == listing && state.filter == filter && state.sorting == sorting
}

/// Background jobs, created once the controller has an address.
struct Jobs {
    folder: FolderWorker,
    filter: DebounceCoalescer,
    ui_filter: DebounceCoalescer,
    status: DebounceCoalescer,
}

impl Jobs {
    fn spawn(core: &Arc<GalleryCore>, enumerator: Arc<dyn FileEnumerator>) -> Result<Self, SchedulerError> {
        let config = &core.config;
        let weak = Arc::downgrade(core);

        let filter = DebounceCoalescer::spawn("filter", config.filter_delay(), {
            let weak = Weak::clone(&weak);
            move || {
                if let Some(core) = weak.upgrade() {
                    core.run_filter();
                }
            }
        })?;
        let ui_filter = DebounceCoalescer::spawn("ui-filter", config.ui_filter_delay(), {
            let weak = Weak::clone(&weak);
            move || {
                if let Some(core) = weak.upgrade() {
                    core.apply_pending_ui();
                }
            }
        })?;
        let status = DebounceCoalescer::spawn("status", config.status_delay(), {
            let weak = Weak::clone(&weak);
            move || {
                if let Some(core) = weak.upgrade() {
                    core.update_status();
                }
            }
        })?;
        let folder = FolderWorker::spawn(
            enumerator,
            Arc::new(move |listing: FolderListing| {
                if let Some(core) = weak.upgrade() {
                    core.on_listing(listing);
                }
            }),
        )?;

        Ok(Self {
            folder,
            filter,
            ui_filter,
            status,
        })
    }
}

struct GalleryCore {
    config: PipelineConfig,
    scheduler: Arc<LoadScheduler>,
    registry: Arc<PhotoRegistry>,
    surface: Arc<dyn GallerySurface>,
    state: Mutex<GalleryState>,
    /// Identifies the listing whose metadata callbacks are current.
    metadata_run: AtomicU64,
    jobs: OnceCell<Jobs>,
}

impl GalleryCore {
    fn on_listing(&self, listing: FolderListing) {
        let FolderListing {
            folder,
            reload,
            files,
        } = listing;

        // Drop what the previous listing queued.
        let cancelled = self.scheduler.cancel_all(true);
        trace!(?folder, cancelled, "Cancelled loads of the previous listing");

        let files = match files {
            Ok(files) => files,
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.listing += 1;
                    state.folder = Some(folder.clone());
                    state.photos.clear();
                    state.filtered.clear();
                    state.pending_ui = None;
                }
                self.surface.set_items(Vec::new());
                self.surface
                    .set_status(Some(format!("Cannot read {}: {:#}", folder.display(), e)));
                return;
            }
        };

        if reload {
            let dropped = self.scheduler.cache().clear_folder(&folder);
            debug!(?folder, dropped, "Reloading folder");
        }

        let mut photos: Vec<Arc<PhotoRecord>> = files
            .iter()
            .map(|path| self.registry.get_or_create(path))
            .collect();
        if reload {
            for photo in &photos {
                if FileInfo::read(photo.path()) != photo.file_info() {
                    self.forget_file(photo);
                }
            }
        }

        info!(?folder, photos = photos.len(), "Showing folder");
        {
            let mut state = self.state.lock();
            state.sorting.sort(&mut photos);
            state.listing += 1;
            state.folder = Some(folder);
            state.photos = photos.clone();
            state.filtered = photos.clone();
            state.pending_ui = None;
        }
        self.surface.set_items(photos);
        self.start_initial_run(true);
    }

    /// Schedule an immediate initial filter run. A new metadata run makes
    /// callbacks of earlier runs stale.
    fn start_initial_run(&self, new_metadata_run: bool) {
        if new_metadata_run {
            self.metadata_run.fetch_add(1, Ordering::AcqRel);
        }
        self.state.lock().initial_pending = true;
        if let Some(jobs) = self.jobs.get() {
            jobs.filter.request_immediate();
        }
    }

    fn run_filter(self: &Arc<Self>) {
        let initial = std::mem::take(&mut self.state.lock().initial_pending);
        if initial {
            self.run_initial_filter();
        } else {
            self.run_filter_update();
        }
    }

    fn snapshot(&self) -> ListingSnapshot {
        let state = self.state.lock();
        ListingSnapshot {
            listing: state.listing,
            photos: state.photos.clone(),
            filter: state.filter,
            sorting: state.sorting,
        }
    }

    fn run_initial_filter(self: &Arc<Self>) {
        let run = self.metadata_run.load(Ordering::Acquire);
        let snapshot = self.snapshot();

        let callback = self.metadata_callback(run);
        let mut queued = 0;
        for photo in snapshot.photos.iter().filter(|p| !p.is_metadata_loaded()) {
            if self.metadata_run.load(Ordering::Acquire) != run {
                debug!(run, queued, "Listing replaced while queueing metadata");
                return;
            }
            match self.scheduler.request_metadata(photo, Some(Arc::clone(&callback))) {
                Ok(true) => queued += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(error = %e, "Metadata requests stopped");
                    break;
                }
            }
        }

        let filtered = apply_filter(&snapshot.photos, snapshot.filter, snapshot.sorting);
        debug!(run, queued, shown = filtered.len(), "Initial filter run");
        {
            let mut state = self.state.lock();
            if !snapshot.is_current(&state) {
                debug!(run, "Listing replaced during initial filter run");
                return;
            }
            state.filtered = filtered.clone();
            state.pending_ui = None;
        }
        self.surface.set_items(filtered);
        self.poke_status();
    }

    fn run_filter_update(&self) {
        if self.filter_update(self.snapshot()) {
            if let Some(jobs) = self.jobs.get() {
                jobs.ui_filter.on_request(Duration::ZERO);
            }
        }
    }

    /// Re-sort and re-filter `snapshot` outside the lock. The result is
    /// committed only while the snapshot is current; returns whether it was.
    fn filter_update(&self, snapshot: ListingSnapshot) -> bool {
        let ListingSnapshot {
            listing,
            mut photos,
            filter,
            sorting,
        } = snapshot;
        // Capture times arrive with the metadata, so the listing order moves too.
        sorting.sort(&mut photos);
        let filtered = apply_filter(&photos, filter, sorting);

        let mut state = self.state.lock();
        if !snapshot_is_current(&state, listing, filter, sorting) {
            trace!(listing, current = state.listing, "Dropping filter update of a replaced listing");
            return false;
        }
        trace!(shown = filtered.len(), "Filter update");
        state.photos = photos;
        state.pending_ui = Some(filtered);
        true
    }

    fn apply_pending_ui(&self) {
        let filtered = {
            let mut state = self.state.lock();
            match state.pending_ui.take() {
                Some(filtered) => {
                    state.filtered = filtered.clone();
                    filtered
                }
                None => return,
            }
        };
        self.surface.set_items(filtered);
    }

    fn update_status(&self) {
        let status = self.scheduler.status();
        self.surface.set_status(status.describe());
        if !status.is_idle() {
            if let Some(jobs) = self.jobs.get() {
                jobs.status.on_request(self.config.status_delay());
            }
        }
    }

    fn poke_status(&self) {
        if let Some(jobs) = self.jobs.get() {
            jobs.status.on_request(self.config.status_delay());
        }
    }

    fn metadata_callback(self: &Arc<Self>, run: u64) -> LoadCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |_: &Arc<PhotoRecord>, _: LoadOutcome| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            if core.metadata_run.load(Ordering::Acquire) != run {
                trace!(run, "Ignoring metadata of an earlier listing");
                return;
            }
            if let Some(jobs) = core.jobs.get() {
                jobs.filter.on_request(core.config.filter_delay());
                jobs.status.on_request(core.config.status_delay());
            }
        })
    }

    fn image_for(
        self: &Arc<Self>,
        photo: &Arc<PhotoRecord>,
        quality: ImageQuality,
        display_size: u32,
    ) -> Option<CacheEntry> {
        let cache = self.scheduler.cache();
        if quality == ImageQuality::Thumbnail && display_size > self.config.thumbnail_size {
            if let Some(entry) = cache.get(photo, ImageQuality::HighQuality) {
                return Some(entry);
            }
        }
        if let Some(entry) = cache.get(photo, quality) {
            return Some(entry);
        }
        if photo.loading_state(quality) == LoadingState::Invalid {
            return None;
        }

        let weak = Arc::downgrade(self);
        let callback: LoadCallback = Arc::new(move |photo: &Arc<PhotoRecord>, _: LoadOutcome| {
            if let Some(core) = weak.upgrade() {
                // Failures redraw too, the surface shows a placeholder.
                core.surface.redraw_item(photo);
                core.poke_status();
            }
        });
        let request = LoadRequest::image(photo, quality)
            .with_size_hint(display_size)
            .gated_by_visibility();
        match self.scheduler.request(request, Some(callback)) {
            Ok(true) => self.poke_status(),
            Ok(false) => {}
            Err(e) => debug!(path = ?photo.path(), error = %e, "Image request dropped"),
        }
        None
    }

    fn forget_file(&self, photo: &PhotoRecord) {
        photo.replace_file();
        self.scheduler.cache().clear_photo(photo.path());
        self.scheduler.metadata_cache().remove(photo.path());
    }

    fn shutdown(&self) {
        if let Some(jobs) = self.jobs.get() {
            jobs.folder.stop();
            jobs.filter.shutdown();
            jobs.ui_filter.shutdown();
            jobs.status.shutdown();
        }
        self.scheduler.cancel_all(true);
    }
}

/// Gallery controller handle. Dropping it shuts the background jobs down.
pub struct Gallery {
    core: Arc<GalleryCore>,
}

impl Gallery {
    pub fn new(
        config: PipelineConfig,
        scheduler: Arc<LoadScheduler>,
        registry: Arc<PhotoRegistry>,
        enumerator: Arc<dyn FileEnumerator>,
        surface: Arc<dyn GallerySurface>,
    ) -> Result<Self, SchedulerError> {
        let cache = Arc::clone(scheduler.cache());
        registry.add_listener(Arc::new(move |path: &Path, _: &Arc<PhotoRecord>| {
            cache.clear_photo(path);
        }));

        let core = Arc::new(GalleryCore {
            config: config.normalized(),
            scheduler,
            registry,
            surface,
            state: Mutex::new(GalleryState::default()),
            metadata_run: AtomicU64::new(0),
            jobs: OnceCell::new(),
        });
        let jobs = Jobs::spawn(&core, enumerator)?;
        if core.jobs.set(jobs).is_err() {
            warn!("Gallery jobs were already running");
        }

        Ok(Self { core })
    }

    /// Build the whole pipeline: `image`-crate decoder, on-disk thumbnail
    /// store when a cache directory exists, walkdir enumeration, and the
    /// surface as visibility probe.
    pub fn with_defaults(
        config: PipelineConfig,
        surface: Arc<dyn GallerySurface>,
    ) -> Result<Self, SchedulerError> {
        let config = config.normalized();

        let mut builder = LoadScheduler::builder()
            .config(config.clone())
            .visibility(Arc::new(SurfaceVisibility(Arc::clone(&surface))));
        match DiskThumbnailStore::new_default() {
            Ok(store) => builder = builder.thumbnail_store(Arc::new(store)),
            Err(e) => warn!(error = %e, "Thumbnails will not be stored on disk"),
        }

        let scheduler = Arc::new(builder.build()?);
        let registry = Arc::new(PhotoRegistry::new(config.photo_cache_capacity)?);
        let enumerator = Arc::new(WalkDirEnumerator::new(config.recursive_scan));
        Self::new(config, scheduler, registry, enumerator, surface)
    }

    /// Show `folder`. Returns false when the folder is already shown and
    /// `reload` is not set, or after shutdown.
    pub fn show_folder(&self, folder: &Path, reload: bool) -> bool {
        let Some(jobs) = self.core.jobs.get() else {
            return false;
        };
        // Cancel before the worker is woken, so only the old folder's loads go.
        let mut cancelled = 0;
        if reload || jobs.folder.current_folder().as_deref() != Some(folder) {
            cancelled = self.core.scheduler.cancel_all(true);
        }
        if !jobs.folder.update(folder, reload) {
            return false;
        }
        debug!(?folder, reload, cancelled, "Requested folder");
        true
    }

    /// Cached image for `photo`, preferring the high-quality image when the
    /// view is larger than a thumbnail. On a miss a visibility-gated load is
    /// queued and the surface is asked to redraw the item once it completes.
    pub fn image_for(
        &self,
        photo: &Arc<PhotoRecord>,
        quality: ImageQuality,
        display_size: u32,
    ) -> Option<CacheEntry> {
        self.core.image_for(photo, quality, display_size)
    }

    pub fn set_filter(&self, filter: PhotoFilter) {
        {
            let mut state = self.core.state.lock();
            if state.filter == filter {
                return;
            }
            state.filter = filter;
        }
        self.core.scheduler.cancel_all(false);
        self.core.start_initial_run(false);
    }

    pub fn set_sorting(&self, sorting: GallerySorting) {
        {
            let mut state = self.core.state.lock();
            if state.sorting == sorting {
                return;
            }
            state.sorting = sorting;
            sorting.sort(&mut state.photos);
        }
        self.core.scheduler.cancel_all(false);
        self.core.start_initial_run(false);
    }

    /// Block until the metadata tier has drained, reporting the remaining
    /// count every poll. Returns false when `cancel` was raised first.
    pub fn wait_for_metadata<F>(&self, cancel: &AtomicBool, mut progress: F) -> bool
    where
        F: FnMut(usize),
    {
        let scheduler = &self.core.scheduler;
        let poll = self.core.config.queue_poll_interval();
        loop {
            let remaining = scheduler.queue_depth(Tier::Metadata) + scheduler.active_in(Tier::Metadata);
            progress(remaining);
            if remaining == 0 {
                return true;
            }
            if cancel.load(Ordering::Acquire) {
                debug!(remaining, "Metadata wait cancelled");
                return false;
            }
            thread::sleep(poll);
        }
    }

    /// Clear the sticky error sets and make invalid photos of the current
    /// listing loadable again.
    pub fn retry_invalid(&self) -> usize {
        let invalid: Vec<Arc<PhotoRecord>> = self
            .core
            .state
            .lock()
            .photos
            .iter()
            .filter(|p| p.is_loading_error() || p.metadata_loading_state() == LoadingState::Invalid)
            .cloned()
            .collect();

        let reset = self.core.scheduler.retry_invalid(&invalid);
        for photo in &invalid {
            self.core.surface.redraw_item(photo);
        }
        if reset > 0 {
            self.core.start_initial_run(false);
        }
        reset
    }

    /// Stop all loading and drop every cached image and metadata block.
    pub fn dispose_all_images(&self) {
        let scheduler = &self.core.scheduler;
        scheduler.cancel_all(true);
        let images = scheduler.cache().clear_all();
        let metadata = scheduler.metadata_cache().clear_all().len();
        debug!(images, metadata, "Disposed all images");
    }

    /// The file behind `photo` changed on disk.
    pub fn replace_file(&self, photo: &Arc<PhotoRecord>) {
        self.core.forget_file(photo);
        self.core.surface.redraw_item(photo);
        self.core.start_initial_run(false);
    }

    pub fn folder(&self) -> Option<PathBuf> {
        self.core.state.lock().folder.clone()
    }

    /// The current listing, sorted.
    pub fn photos(&self) -> Vec<Arc<PhotoRecord>> {
        self.core.state.lock().photos.clone()
    }

    /// The list last handed to the surface.
    pub fn filtered(&self) -> Vec<Arc<PhotoRecord>> {
        self.core.state.lock().filtered.clone()
    }

    pub fn filter(&self) -> PhotoFilter {
        self.core.state.lock().filter
    }

    pub fn sorting(&self) -> GallerySorting {
        self.core.state.lock().sorting
    }

    pub fn status(&self) -> QueueStatus {
        self.core.scheduler.status()
    }

    pub fn scheduler(&self) -> &Arc<LoadScheduler> {
        &self.core.scheduler
    }

    pub fn registry(&self) -> &Arc<PhotoRegistry> {
        &self.core.registry
    }

    /// Stop the folder worker and the coalescers. Terminal.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl Drop for Gallery {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Gallery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Gallery")
            .field("folder", &state.folder)
            .field("photos", &state.photos.len())
            .field("filtered", &state.filtered.len())
            .field("filter", &state.filter)
            .field("sorting", &state.sorting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::loader::ImageDecoder;
    use crate::models::{GalleryItem, GeoPosition, PhotoMetadata};
    use flume::{Receiver, Sender};
    use image::DynamicImage;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingSurface {
        hidden: Mutex<Vec<String>>,
        items: Mutex<Vec<Vec<String>>>,
        redraws: Mutex<Vec<PathBuf>>,
        statuses: Mutex<Vec<Option<String>>>,
    }

    impl RecordingSurface {
        fn last_items(&self) -> Option<Vec<String>> {
            self.items.lock().last().cloned()
        }
    }

    impl GallerySurface for RecordingSurface {
        fn is_visible(&self, key: &str) -> bool {
            !self.hidden.lock().iter().any(|k| k == key)
        }

        fn set_items(&self, items: Vec<Arc<PhotoRecord>>) {
            let names = items.iter().map(|p| p.file_name().to_owned()).collect();
            self.items.lock().push(names);
        }

        fn redraw_item(&self, photo: &Arc<PhotoRecord>) {
            self.redraws.lock().push(photo.path().to_path_buf());
        }

        fn set_status(&self, status: Option<String>) {
            self.statuses.lock().push(status);
        }
    }

    /// Metadata is derived from the file name: `gps` in the name adds a
    /// position, the capture time comes from `CAPTURE`.
    struct FakeDecoder {
        slow: Receiver<()>,
    }

    const CAPTURE: [(&str, i64); 3] = [("a.jpg", 3_000), ("b.jpg", 1_000), ("c_gps.jpg", 2_000)];

    impl ImageDecoder for FakeDecoder {
        fn decode(
            &self,
            path: &Path,
            quality: ImageQuality,
            _size_hint: u32,
        ) -> Result<DynamicImage, DecodeError> {
            if path.to_string_lossy().contains("bad") {
                return Err(DecodeError::Unsupported {
                    path: path.to_path_buf(),
                });
            }
            let side = match quality {
                ImageQuality::Thumbnail => 160,
                ImageQuality::HighQuality => 600,
                ImageQuality::Original => 1200,
            };
            Ok(DynamicImage::new_rgb8(side, side / 2))
        }

        fn read_metadata(&self, path: &Path) -> Result<PhotoMetadata, DecodeError> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if name.contains("slow") {
                let _ = self.slow.recv_timeout(WAIT);
            }
            let capture_time_ms = CAPTURE.iter().find(|(n, _)| *n == name).map(|(_, t)| *t);
            let gps = name.contains("gps").then_some(GeoPosition {
                latitude: 46.5,
                longitude: 7.9,
                altitude: Some(1_500.0),
            });
            Ok(PhotoMetadata {
                capture_time_ms,
                gps,
                ..Default::default()
            })
        }
    }

    struct Fixture {
        gallery: Gallery,
        surface: Arc<RecordingSurface>,
        release: Sender<()>,
        dir: tempfile::TempDir,
    }

    fn fixture(files: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            std::fs::write(dir.path().join(name), b"jpeg").unwrap();
        }

        let config = PipelineConfig {
            metadata_workers: Some(2),
            thumbnail_workers: Some(1),
            filter_delay_ms: 20,
            ui_filter_delay_ms: 10,
            status_delay_ms: 10,
            queue_poll_interval_ms: 10,
            ..Default::default()
        };
        let (release, slow) = flume::unbounded();
        let surface = Arc::new(RecordingSurface::default());
        let scheduler = LoadScheduler::builder()
            .config(config.clone())
            .decoder(Arc::new(FakeDecoder { slow }))
            .visibility(Arc::new(SurfaceVisibility(
                Arc::clone(&surface) as Arc<dyn GallerySurface>
            )))
            .build()
            .unwrap();
        let gallery = Gallery::new(
            config,
            Arc::new(scheduler),
            Arc::new(PhotoRegistry::new(100).unwrap()),
            Arc::new(WalkDirEnumerator::new(false)),
            Arc::clone(&surface) as Arc<dyn GallerySurface>,
        )
        .unwrap();

        Fixture {
            gallery,
            surface,
            release,
            dir,
        }
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn names(photos: &[Arc<PhotoRecord>]) -> Vec<&str> {
        photos.iter().map(|p| p.file_name()).collect()
    }

    #[test]
    fn test_show_folder_loads_metadata_and_sorts_by_capture_time() {
        let f = fixture(&["a.jpg", "b.jpg", "c_gps.jpg", "notes.txt"]);
        assert!(f.gallery.show_folder(f.dir.path(), false));

        assert!(eventually(|| f.gallery.photos().len() == 3
            && f.gallery.photos().iter().all(|p| p.is_metadata_loaded())));
        assert!(eventually(|| {
            f.surface.last_items() == Some(vec!["b.jpg".into(), "c_gps.jpg".into(), "a.jpg".into()])
        }));
        assert_eq!(names(&f.gallery.filtered()), vec!["b.jpg", "c_gps.jpg", "a.jpg"]);
        assert_eq!(f.gallery.folder().as_deref(), Some(f.dir.path()));
    }

    #[test]
    fn test_repeat_folder_needs_reload() {
        let f = fixture(&["a.jpg"]);
        assert!(f.gallery.show_folder(f.dir.path(), false));
        assert!(eventually(|| f.gallery.photos().len() == 1));

        assert!(!f.gallery.show_folder(f.dir.path(), false));
        assert!(f.gallery.show_folder(f.dir.path(), true));
    }

    #[test]
    fn test_gps_filter_and_name_sorting() {
        let f = fixture(&["a.jpg", "b.jpg", "c_gps.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().iter().filter(|p| p.is_metadata_loaded()).count() == 3));

        f.gallery.set_filter(PhotoFilter::WithGps);
        assert!(eventually(|| names(&f.gallery.filtered()) == vec!["c_gps.jpg"]));

        f.gallery.set_filter(PhotoFilter::NoGps);
        f.gallery.set_sorting(GallerySorting::ByName);
        assert!(eventually(|| names(&f.gallery.filtered()) == vec!["a.jpg", "b.jpg"]));
        assert_eq!(f.gallery.filter(), PhotoFilter::NoGps);
        assert_eq!(f.gallery.sorting(), GallerySorting::ByName);
    }

    #[test]
    fn test_image_for_loads_and_redraws() {
        let f = fixture(&["a.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 1));
        let photo = f.gallery.photos()[0].clone();

        assert!(f.gallery.image_for(&photo, ImageQuality::Thumbnail, 160).is_none());
        assert!(eventually(|| f.surface.redraws.lock().contains(&photo.path().to_path_buf())));

        let entry = f.gallery.image_for(&photo, ImageQuality::Thumbnail, 160).unwrap();
        assert_eq!(entry.quality, ImageQuality::Thumbnail);
    }

    #[test]
    fn test_large_view_prefers_high_quality() {
        let f = fixture(&["a.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 1));
        let photo = f.gallery.photos()[0].clone();

        f.gallery.image_for(&photo, ImageQuality::Thumbnail, 600);
        // the 160 px thumbnail cascades to a high-quality load
        assert!(eventually(|| f
            .gallery
            .scheduler()
            .cache()
            .contains(photo.path(), ImageQuality::HighQuality)));

        let entry = f.gallery.image_for(&photo, ImageQuality::Thumbnail, 600).unwrap();
        assert_eq!(entry.quality, ImageQuality::HighQuality);
    }

    #[test]
    fn test_hidden_item_is_not_decoded() {
        let f = fixture(&["a.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 1));
        let photo = f.gallery.photos()[0].clone();
        f.surface.hidden.lock().push(photo.unique_key().to_owned());

        f.gallery.image_for(&photo, ImageQuality::Original, 1200);
        // InQueue until a worker has dequeued and skipped the item
        assert!(eventually(|| photo.loading_state(ImageQuality::Original) == LoadingState::Undefined
            && f.gallery.scheduler().queue_depth(Tier::Original) == 0));
        assert!(!f.gallery.scheduler().cache().contains(photo.path(), ImageQuality::Original));
    }

    #[test]
    fn test_invalid_photo_and_retry() {
        let f = fixture(&["bad.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 1));
        let photo = f.gallery.photos()[0].clone();

        f.gallery.image_for(&photo, ImageQuality::Thumbnail, 160);
        assert!(eventually(|| photo.loading_state(ImageQuality::Thumbnail) == LoadingState::Invalid));
        assert!(f.gallery.image_for(&photo, ImageQuality::Thumbnail, 160).is_none());

        assert_eq!(f.gallery.retry_invalid(), 1);
        assert_eq!(photo.loading_state(ImageQuality::Thumbnail), LoadingState::Undefined);
        assert_eq!(f.gallery.scheduler().errors().load_error_count(), 0);
    }

    #[test]
    fn test_wait_for_metadata_can_be_cancelled() {
        let f = fixture(&["a.jpg", "slow.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 2));
        assert!(eventually(|| f.gallery.scheduler().active_in(Tier::Metadata) == 1));

        let cancel = AtomicBool::new(true);
        let mut reports = Vec::new();
        assert!(!f.gallery.wait_for_metadata(&cancel, |n| reports.push(n)));
        assert_eq!(reports, vec![1]);

        f.release.send(()).unwrap();
        let cancel = AtomicBool::new(false);
        assert!(f.gallery.wait_for_metadata(&cancel, |_| {}));
    }

    #[test]
    fn test_status_line_clears_when_idle() {
        let f = fixture(&["a.jpg", "b.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 2));
        assert!(eventually(|| f.gallery.status().is_idle()
            && f.surface.statuses.lock().last() == Some(&None)));
    }

    #[test]
    fn test_missing_folder_reports_status() {
        let f = fixture(&[]);
        let missing = f.dir.path().join("missing");
        assert!(f.gallery.show_folder(&missing, false));
        assert!(eventually(|| f
            .surface
            .statuses
            .lock()
            .iter()
            .flatten()
            .any(|s| s.starts_with("Cannot read"))));
        assert!(f.gallery.photos().is_empty());
    }

    #[test]
    fn test_dispose_all_images() {
        let f = fixture(&["a.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 1));
        let photo = f.gallery.photos()[0].clone();
        assert!(eventually(|| photo.is_metadata_loaded()));
        f.gallery.image_for(&photo, ImageQuality::Thumbnail, 160);
        assert!(eventually(|| f.gallery.image_for(&photo, ImageQuality::Thumbnail, 160).is_some()));

        f.gallery.dispose_all_images();
        assert!(!f.gallery.scheduler().cache().contains(photo.path(), ImageQuality::Thumbnail));
        assert!(f.gallery.scheduler().metadata_cache().is_empty());
    }

    #[test]
    fn test_filter_update_of_replaced_listing_is_dropped() {
        let f = fixture(&["a.jpg", "b.jpg"]);
        f.gallery.show_folder(f.dir.path(), false);
        assert!(eventually(|| f.gallery.photos().len() == 2
            && f.gallery.photos().iter().all(|p| p.is_metadata_loaded())));
        let stale = f.gallery.core.snapshot();

        let other = tempfile::tempdir().unwrap();
        let fresh = other.path().join("c_gps.jpg");
        std::fs::write(&fresh, b"jpeg").unwrap();
        f.gallery.core.on_listing(FolderListing {
            folder: other.path().to_path_buf(),
            reload: false,
            files: Ok(vec![fresh]),
        });

        assert!(!f.gallery.core.filter_update(stale));
        assert_eq!(f.gallery.folder().as_deref(), Some(other.path()));
        assert_eq!(names(&f.gallery.photos()), vec!["c_gps.jpg"]);
        assert!(eventually(|| names(&f.gallery.filtered()) == vec!["c_gps.jpg"]));

        assert!(f.gallery.core.filter_update(f.gallery.core.snapshot()));
        assert_eq!(names(&f.gallery.photos()), vec!["c_gps.jpg"]);
    }

    #[test]
    fn test_switching_folders_keeps_new_metadata_requests() {
        let f = fixture(&[]);
        for round in 0..10 {
            let folder = f.dir.path().join(format!("folder-{round}"));
            std::fs::create_dir(&folder).unwrap();
            for name in ["a.jpg", "b.jpg"] {
                std::fs::write(folder.join(name), b"jpeg").unwrap();
            }

            assert!(f.gallery.show_folder(&folder, false));
            assert!(
                eventually(|| {
                    let photos = f.gallery.photos();
                    f.gallery.folder().as_deref() == Some(folder.as_path())
                        && photos.len() == 2
                        && photos.iter().all(|p| p.is_metadata_loaded())
                }),
                "metadata of {} never loaded",
                folder.display()
            );
        }
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let f = fixture(&["a.jpg"]);
        f.gallery.shutdown();
        assert!(!f.gallery.show_folder(f.dir.path(), false));
        assert!(f.surface.items.lock().is_empty());
    }
}
