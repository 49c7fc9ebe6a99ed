//! Image and metadata loading.
//!
//! - Four tiers (metadata, thumbnail, high-quality, original), each with its
//!   own queue and worker pool
//! - Decoding goes through the `ImageDecoder` collaborator
//! - Thumbnails are looked up in / saved to a `ThumbnailStore`
//! - Results land in the image cache and are reported through callbacks

mod decoder;
mod errors;
mod request;
mod scheduler;
mod store;
mod tier;

pub use decoder::{open_image, read_dimensions, ImageCrateDecoder, ImageDecoder};
pub use errors::ErrorMemo;
pub use request::{AlwaysVisible, LoadCallback, LoadOutcome, LoadRequest, LoadTicket, VisibilityProbe};
pub use scheduler::{LoadScheduler, LoadSchedulerBuilder, QueueStatus};
pub use store::{DiskThumbnailStore, NoThumbnailStore, ThumbnailStore};
pub use tier::{DequeueOrder, Tier};
