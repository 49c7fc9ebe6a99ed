//! Photo loading pipeline for gallery views.
//!
//! A tiered decode scheduler feeds two bounded image caches whose evictions
//! are handled off the calling thread. A gallery controller on top enumerates
//! folders on a dedicated thread and coalesces filter and status updates.

pub mod cache;
pub mod config;
pub mod debounce;
pub mod error;
pub mod gallery;
pub mod loader;
pub mod models;
pub mod scanner;

pub use cache::{BoundedImageCache, CacheEntry, ObjectCache, PhotoImageCache};
pub use config::PipelineConfig;
pub use debounce::DebounceCoalescer;
pub use error::{ConfigError, DecodeError, SchedulerError, StoreError};
pub use gallery::{Gallery, GallerySorting, GallerySurface, PhotoFilter};
pub use loader::{LoadOutcome, LoadRequest, LoadScheduler, Tier};
pub use models::{ImageQuality, LoadingState, PhotoRecord, PhotoRegistry};
