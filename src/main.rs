use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use photoload::cache::CacheTier;
use photoload::loader::{DiskThumbnailStore, LoadCallback};
use photoload::scanner::{FileEnumerator, WalkDirEnumerator};
use photoload::{ImageQuality, LoadOutcome, LoadScheduler, PhotoRecord, PhotoRegistry, PipelineConfig};

#[derive(Debug, Parser)]
#[command(
    name = "photoload",
    version,
    about = "Load metadata and thumbnails for every photo in a folder",
    long_about = None
)]
struct Cli {
    /// Folder to load.
    folder: PathBuf,

    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Descend into sub-folders.
    #[arg(short, long)]
    recursive: bool,

    /// Keep generated thumbnails in memory only.
    #[arg(long)]
    no_store: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("photoload=info".parse().context("Invalid log directive")?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::load_default()?,
    };
    config.recursive_scan |= cli.recursive;

    let mut builder = LoadScheduler::builder().config(config.clone());
    if !cli.no_store {
        match DiskThumbnailStore::new_default() {
            Ok(store) => {
                info!(dir = ?store.cache_dir(), "Storing thumbnails");
                builder = builder.thumbnail_store(Arc::new(store));
            }
            Err(e) => warn!(error = %e, "Thumbnails will not be stored on disk"),
        }
    }
    let scheduler = builder.build().context("Failed to start load workers")?;
    let registry = PhotoRegistry::new(config.photo_cache_capacity)?;

    let files = WalkDirEnumerator::new(config.recursive_scan)
        .enumerate(&cli.folder)
        .with_context(|| format!("Failed to list {}", cli.folder.display()))?;
    let photos: Vec<Arc<PhotoRecord>> = files.iter().map(|p| registry.get_or_create(p)).collect();
    info!(folder = ?cli.folder, photos = photos.len(), "Loading folder");

    let started = Instant::now();
    let loaded = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let callback: LoadCallback = {
        let loaded = Arc::clone(&loaded);
        let failed = Arc::clone(&failed);
        Arc::new(move |_: &Arc<PhotoRecord>, outcome: LoadOutcome| {
            let counter = if outcome.is_success() { &loaded } else { &failed };
            counter.fetch_add(1, Ordering::Relaxed);
        })
    };

    for photo in &photos {
        scheduler.request_metadata(photo, None)?;
        scheduler.request_load(photo, ImageQuality::Thumbnail, Arc::clone(&callback))?;
    }

    let poll = config.queue_poll_interval();
    let mut last_report = Instant::now();
    while !scheduler.is_idle() {
        if last_report.elapsed() >= Duration::from_secs(1) {
            if let Some(status) = scheduler.status().describe() {
                info!("{}", status);
            }
            last_report = Instant::now();
        }
        thread::sleep(poll);
    }

    let invalid = photos.iter().filter(|p| p.is_loading_error()).count();
    let with_metadata = photos.iter().filter(|p| p.is_metadata_loaded()).count();
    let cache = scheduler.cache();
    info!(
        photos = photos.len(),
        thumbnails = loaded.load(Ordering::Relaxed),
        failed = failed.load(Ordering::Relaxed),
        invalid,
        with_metadata,
        cached = cache.len(CacheTier::Thumbnail),
        capacity = cache.capacity(CacheTier::Thumbnail),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Folder loaded"
    );

    scheduler.shutdown();
    Ok(())
}
