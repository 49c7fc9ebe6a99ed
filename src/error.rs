//! Error types for the loading pipeline.
//!
//! Decode and store failures never cross the worker boundary as `Err`; the
//! scheduler folds them into `LoadOutcome::Failed` and the sticky error sets.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to turn a file into a decoded image or metadata block.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("unsupported image file {path:?}")]
    Unsupported { path: PathBuf },

    #[error("decoder panicked on {path:?}: {message}")]
    Panicked { path: PathBuf, message: String },

    /// The path is in the sticky load-error set; no decode was attempted.
    #[error("{path:?} failed to load earlier")]
    PreviouslyFailed { path: PathBuf },
}

impl DecodeError {
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Io { path, .. }
            | Self::Image { path, .. }
            | Self::Unsupported { path }
            | Self::Panicked { path, .. }
            | Self::PreviouslyFailed { path } => path,
        }
    }
}

/// Failure of the on-disk thumbnail store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write thumbnail {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode thumbnail {path:?}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no cache directory available")]
    NoCacheDir,
}

/// Misuse of the load scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("load scheduler has been shut down")]
    ShutDown,

    #[error("failed to spawn {name} worker: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to load the pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
