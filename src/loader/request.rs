//! Load requests, queue items and completion reporting.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, TryRecvError};

use super::tier::Tier;
use crate::cache::CacheEntry;
use crate::error::DecodeError;
use crate::models::{GalleryItem, ImageQuality, PhotoMetadata, PhotoRecord};

/// Answers whether an item is still on screen.
///
/// Queried by workers right before decoding a visibility-gated request.
pub trait VisibilityProbe: Send + Sync {
    fn is_visible(&self, key: &str) -> bool;
}

/// Probe for headless use: everything is visible.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysVisible;

impl VisibilityProbe for AlwaysVisible {
    fn is_visible(&self, _key: &str) -> bool {
        true
    }
}

/// What to load for which photo.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    photo: Arc<PhotoRecord>,
    tier: Tier,
    /// Requested on-screen size in pixels, 0 when unknown.
    size_hint: u32,
    visibility_gated: bool,
}

impl LoadRequest {
    pub fn image(photo: &Arc<PhotoRecord>, quality: ImageQuality) -> Self {
        Self {
            photo: Arc::clone(photo),
            tier: Tier::from(quality),
            size_hint: 0,
            visibility_gated: false,
        }
    }

    pub fn metadata(photo: &Arc<PhotoRecord>) -> Self {
        Self {
            photo: Arc::clone(photo),
            tier: Tier::Metadata,
            size_hint: 0,
            visibility_gated: false,
        }
    }

    pub fn with_size_hint(mut self, size_hint: u32) -> Self {
        self.size_hint = size_hint;
        self
    }

    /// Skip the decode if the item is no longer visible when a worker picks it up.
    pub fn gated_by_visibility(mut self) -> Self {
        self.visibility_gated = true;
        self
    }

    pub fn photo(&self) -> &Arc<PhotoRecord> {
        &self.photo
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn quality(&self) -> Option<ImageQuality> {
        self.tier.quality()
    }

    pub fn size_hint(&self) -> u32 {
        self.size_hint
    }

    pub fn is_visibility_gated(&self) -> bool {
        self.visibility_gated
    }

    pub fn visibility_key(&self) -> &str {
        self.photo.unique_key()
    }
}

/// Result passed to a completion callback.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Image(CacheEntry),
    Metadata(Arc<PhotoMetadata>),
    Failed {
        tier: Tier,
        error: Arc<DecodeError>,
    },
}

impl LoadOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn image(&self) -> Option<&CacheEntry> {
        match self {
            Self::Image(entry) => Some(entry),
            _ => None,
        }
    }
}

/// Completion callback.
///
/// Runs on an unspecified worker thread. Work that has to happen on a UI
/// thread must be re-dispatched by the callback itself.
pub type LoadCallback = Arc<dyn Fn(&Arc<PhotoRecord>, LoadOutcome) + Send + Sync>;

/// A request waiting in a tier queue. Consumed exactly once.
pub(crate) struct QueueItem {
    request: LoadRequest,
    callback: Option<LoadCallback>,
}

impl QueueItem {
    pub(crate) fn new(request: LoadRequest, callback: Option<LoadCallback>) -> Self {
        Self { request, callback }
    }

    pub(crate) fn photo(&self) -> &Arc<PhotoRecord> {
        self.request.photo()
    }

    pub(crate) fn request(&self) -> &LoadRequest {
        &self.request
    }

    pub(crate) fn callback(&self) -> Option<&LoadCallback> {
        self.callback.as_ref()
    }

    pub(crate) fn complete(&self, outcome: LoadOutcome) {
        if let Some(callback) = &self.callback {
            callback(self.request.photo(), outcome);
        }
    }
}

/// One-shot handle on a queued load.
///
/// Resolves with the outcome, or to nothing when the item was cancelled
/// before a worker decoded it.
pub struct LoadTicket {
    rx: Receiver<LoadOutcome>,
}

impl LoadTicket {
    /// Create a ticket and the callback that resolves it.
    pub(crate) fn pair() -> (Self, LoadCallback) {
        let (tx, rx) = flume::bounded(1);
        let callback: LoadCallback = Arc::new(move |_: &Arc<PhotoRecord>, outcome: LoadOutcome| {
            // Only the first outcome counts; a cascaded load reuses the callback.
            let _ = tx.try_send(outcome);
        });
        (Self { rx }, callback)
    }

    /// Block until the load completes; `None` if it was cancelled.
    pub fn wait(self) -> Option<LoadOutcome> {
        self.rx.recv().ok()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<LoadOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Non-blocking check.
    pub fn try_outcome(&self) -> Option<LoadOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// True once the item was dropped without producing an outcome.
    pub fn is_cancelled(&self) -> bool {
        self.rx.is_disconnected() && self.rx.is_empty()
    }
}

impl std::fmt::Debug for LoadTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTicket")
            .field("ready", &!self.rx.is_empty())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
