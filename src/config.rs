//! Pipeline configuration.
//!
//! Read once at construction time. Every field has a default so a partial
//! (or missing) `config.toml` is fine.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Native size of a thumbnail decode in pixels.
pub const IMAGE_SIZE_THUMBNAIL: u32 = 160;

/// Default size of a high-quality decode in pixels.
pub const IMAGE_SIZE_LARGE_DEFAULT: u32 = 600;

/// Accepted high-quality decode sizes.
pub const HQ_IMAGE_SIZES: [u32; 4] = [200, IMAGE_SIZE_LARGE_DEFAULT, 1000, 2000];

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Entries held by the thumbnail/high-quality image cache.
    pub thumbnail_cache_capacity: usize,
    /// Entries held by the original-size image cache.
    pub original_cache_capacity: usize,
    /// Photo records kept in the registry.
    pub photo_cache_capacity: usize,
    /// Metadata blocks kept in the metadata cache.
    pub metadata_cache_capacity: usize,
    /// Metadata pool size, `None` = available parallelism.
    pub metadata_workers: Option<usize>,
    /// Thumbnail pool size, `None` = available parallelism.
    pub thumbnail_workers: Option<usize>,
    pub thumbnail_size: u32,
    pub hq_image_size: u32,
    pub filter_delay_ms: u64,
    pub ui_filter_delay_ms: u64,
    pub status_delay_ms: u64,
    pub queue_poll_interval_ms: u64,
    pub recursive_scan: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            thumbnail_cache_capacity: 500,
            original_cache_capacity: 5,
            photo_cache_capacity: 20_000,
            metadata_cache_capacity: 20_000,
            metadata_workers: None,
            thumbnail_workers: None,
            thumbnail_size: IMAGE_SIZE_THUMBNAIL,
            hq_image_size: IMAGE_SIZE_LARGE_DEFAULT,
            filter_delay_ms: 500,
            ui_filter_delay_ms: 200,
            status_delay_ms: 200,
            queue_poll_interval_ms: 100,
            recursive_scan: false,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document and normalize the result.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        Ok(config.normalized())
    }

    /// Load the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(?path, "Loaded pipeline config");
        Ok(config)
    }

    /// Load the config from the default location, falling back to defaults
    /// when no file exists there.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/photoload/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "photoload").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Clamp values that would make the pipeline unusable.
    pub fn normalized(mut self) -> Self {
        if !HQ_IMAGE_SIZES.contains(&self.hq_image_size) {
            warn!(
                hq_image_size = self.hq_image_size,
                "Unsupported high-quality size, using default"
            );
            self.hq_image_size = IMAGE_SIZE_LARGE_DEFAULT;
        }
        self.thumbnail_size = self.thumbnail_size.max(1);
        self.thumbnail_cache_capacity = self.thumbnail_cache_capacity.max(1);
        self.original_cache_capacity = self.original_cache_capacity.max(1);
        self.photo_cache_capacity = self.photo_cache_capacity.max(1);
        self.metadata_cache_capacity = self.metadata_cache_capacity.max(1);
        self
    }

    pub fn metadata_pool_size(&self) -> usize {
        self.metadata_workers.unwrap_or_else(available_parallelism).max(1)
    }

    pub fn thumbnail_pool_size(&self) -> usize {
        self.thumbnail_workers.unwrap_or_else(available_parallelism).max(1)
    }

    pub fn filter_delay(&self) -> Duration {
        Duration::from_millis(self.filter_delay_ms)
    }

    pub fn ui_filter_delay(&self) -> Duration {
        Duration::from_millis(self.ui_filter_delay_ms)
    }

    pub fn status_delay(&self) -> Duration {
        Duration::from_millis(self.status_delay_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms.max(1))
    }
}

fn available_parallelism() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
