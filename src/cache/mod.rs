//! Bounded caches with asynchronous eviction.
//!
//! - `BoundedImageCache`: generic LRU map, removed values go to a single
//!   eviction worker
//! - `ObjectCache`: path-keyed variant with eviction listeners
//! - `PhotoImageCache`: thumbnail/high-quality and original tiers

mod bounded;
mod eviction;
mod image_cache;
mod object;

pub use bounded::{BoundedImageCache, Eviction, EvictionReason};
pub use eviction::{EvictionCallback, EvictionQueue};
pub use image_cache::{CacheEntry, CacheKey, CacheTier, PhotoImageCache};
pub use object::{EvictionListener, ObjectCache};
