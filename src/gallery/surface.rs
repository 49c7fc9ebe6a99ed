use std::sync::Arc;

use crate::loader::VisibilityProbe;
use crate::models::PhotoRecord;

/// The view the gallery drives.
///
/// Every method may be called from a worker or coalescer thread.
/// Implementations that own UI state must re-dispatch to their UI thread.
pub trait GallerySurface: Send + Sync {
    fn is_visible(&self, key: &str) -> bool;

    /// Replace the displayed list.
    fn set_items(&self, items: Vec<Arc<PhotoRecord>>);

    /// An image of `photo` finished loading.
    fn redraw_item(&self, photo: &Arc<PhotoRecord>);

    /// Status line text, `None` clears it.
    fn set_status(&self, status: Option<String>);
}

/// Lets the load scheduler ask the surface about visibility.
pub struct SurfaceVisibility(pub Arc<dyn GallerySurface>);

impl VisibilityProbe for SurfaceVisibility {
    fn is_visible(&self, key: &str) -> bool {
        self.0.is_visible(key)
    }
}
