//! Folder enumeration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Extensions the `image` crate build can decode.
pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff", "tif"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Lists the image files of a folder, ordered by path.
pub trait FileEnumerator: Send + Sync {
    fn enumerate(&self, folder: &Path) -> Result<Vec<PathBuf>>;
}

/// Enumerator backed by walkdir.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkDirEnumerator {
    /// Whether to descend into sub-folders.
    pub recursive: bool,
    pub follow_symlinks: bool,
}

impl WalkDirEnumerator {
    pub fn new(recursive: bool) -> Self {
        Self {
            recursive,
            follow_symlinks: false,
        }
    }
}

impl FileEnumerator for WalkDirEnumerator {
    fn enumerate(&self, folder: &Path) -> Result<Vec<PathBuf>> {
        let meta = std::fs::metadata(folder)
            .with_context(|| format!("Failed to read folder: {:?}", folder))?;
        if !meta.is_dir() {
            anyhow::bail!("Not a folder: {:?}", folder);
        }

        let mut walker = WalkDir::new(folder).follow_links(self.follow_symlinks);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry in walker.into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(?folder, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            if is_image_file(entry.path()) {
                files.push(entry.into_path());
            }
        }

        // Sort by path for consistent ordering
        files.sort();
        debug!(?folder, count = files.len(), "Enumerated folder");
        Ok(files)
    }
}
