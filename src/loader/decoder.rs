//! Decoder collaborator.
//!
//! The scheduler only needs "file + quality in, pixels out" and "file in,
//! metadata block out". `ImageCrateDecoder` provides both on top of the
//! `image` crate; EXIF parsing is left to other implementations.

use std::io::Cursor;
use std::path::Path;

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, GenericImageView, ImageFormat, ImageReader};
use tracing::trace;

use crate::config::{IMAGE_SIZE_LARGE_DEFAULT, IMAGE_SIZE_THUMBNAIL};
use crate::error::DecodeError;
use crate::models::{ImageQuality, PhotoMetadata};

/// Turns files into pixels and metadata. Called only from worker threads.
pub trait ImageDecoder: Send + Sync {
    /// Decode `path` at `quality`. `size_hint` is the on-screen size in
    /// pixels, 0 when unknown.
    fn decode(
        &self,
        path: &Path,
        quality: ImageQuality,
        size_hint: u32,
    ) -> Result<DynamicImage, DecodeError>;

    fn read_metadata(&self, path: &Path) -> Result<PhotoMetadata, DecodeError>;
}

/// Decoder backed by the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateDecoder {
    thumbnail_size: u32,
    hq_size: u32,
}

impl ImageCrateDecoder {
    pub fn new(thumbnail_size: u32, hq_size: u32) -> Self {
        Self {
            thumbnail_size: thumbnail_size.max(1),
            hq_size: hq_size.max(1),
        }
    }

    /// Longest side a decode of `quality` is scaled down to, `None` for full size.
    fn target_size(&self, quality: ImageQuality) -> Option<u32> {
        match quality {
            ImageQuality::Thumbnail => Some(self.thumbnail_size),
            ImageQuality::HighQuality => Some(self.hq_size),
            ImageQuality::Original => None,
        }
    }
}

impl Default for ImageCrateDecoder {
    fn default() -> Self {
        Self::new(IMAGE_SIZE_THUMBNAIL, IMAGE_SIZE_LARGE_DEFAULT)
    }
}

impl ImageDecoder for ImageCrateDecoder {
    fn decode(
        &self,
        path: &Path,
        quality: ImageQuality,
        size_hint: u32,
    ) -> Result<DynamicImage, DecodeError> {
        let img = open_image(path)?;
        let (width, height) = img.dimensions();

        let Some(target) = self.target_size(quality) else {
            return Ok(img);
        };
        if width <= target && height <= target {
            return Ok(img);
        }

        trace!(?path, %quality, size_hint, width, height, target, "Scaling decoded image");
        // CatmullRom is a good quality/speed balance for downscaling
        Ok(img.resize(target, target, FilterType::CatmullRom))
    }

    fn read_metadata(&self, path: &Path) -> Result<PhotoMetadata, DecodeError> {
        let (width, height) = read_dimensions(path)?;
        Ok(PhotoMetadata {
            width,
            height,
            orientation: 1,
            ..Default::default()
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, DecodeError> {
    std::fs::read(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn image_error(path: &Path) -> impl FnOnce(image::ImageError) -> DecodeError + '_ {
    move |source| DecodeError::Image {
        path: path.to_path_buf(),
        source,
    }
}

/// Decode the first frame of a GIF.
fn first_gif_frame(path: &Path, bytes: Vec<u8>) -> Result<DynamicImage, DecodeError> {
    let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(image_error(path))?;
    match decoder.into_frames().next() {
        Some(frame) => {
            let frame = frame.map_err(image_error(path))?;
            Ok(DynamicImage::ImageRgba8(frame.into_buffer()))
        }
        None => Err(DecodeError::Unsupported {
            path: path.to_path_buf(),
        }),
    }
}

/// Open any supported image; animated GIFs yield their first frame.
pub fn open_image(path: &Path) -> Result<DynamicImage, DecodeError> {
    let bytes = read_file(path)?;
    let format = image::guess_format(&bytes).ok();

    match format {
        Some(ImageFormat::Gif) => first_gif_frame(path, bytes),
        Some(fmt) => image::load_from_memory_with_format(&bytes, fmt).map_err(image_error(path)),
        None => Err(DecodeError::Unsupported {
            path: path.to_path_buf(),
        }),
    }
}

/// Read pixel dimensions, decoding only the header where the format allows.
pub fn read_dimensions(path: &Path) -> Result<(u32, u32), DecodeError> {
    let bytes = read_file(path)?;
    let format = image::guess_format(&bytes).ok();

    if format == Some(ImageFormat::Gif) {
        return first_gif_frame(path, bytes).map(|img| img.dimensions());
    }
    if format.is_none() {
        return Err(DecodeError::Unsupported {
            path: path.to_path_buf(),
        });
    }

    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .into_dimensions()
        .map_err(image_error(path))
}
