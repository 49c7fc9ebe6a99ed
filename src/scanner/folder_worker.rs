//! Dedicated folder enumeration thread.
//!
//! The thread sleeps on a condition variable until a folder is requested,
//! lists it, and reports the listing unless a newer request arrived in the
//! meantime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::enumerate::FileEnumerator;
use crate::error::SchedulerError;

/// Result of one enumeration cycle.
#[derive(Debug)]
pub struct FolderListing {
    pub folder: PathBuf,
    pub reload: bool,
    pub files: Result<Vec<PathBuf>>,
}

/// Receives listings on the folder worker thread.
pub type FolderListener = Arc<dyn Fn(FolderListing) + Send + Sync>;

#[derive(Debug, Default)]
struct State {
    /// Folder of the most recent request.
    current: Option<PathBuf>,
    pending: Option<(PathBuf, bool)>,
    /// Bumped on every accepted request; a listing from an older
    /// generation is stale.
    generation: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

pub struct FolderWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FolderWorker {
    pub fn spawn(
        enumerator: Arc<dyn FileEnumerator>,
        listener: FolderListener,
    ) -> Result<Self, SchedulerError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("folder-worker".to_owned())
            .spawn(move || worker_loop(thread_shared, enumerator, listener))
            .map_err(|source| SchedulerError::Spawn {
                name: "folder-worker".to_owned(),
                source,
            })?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Ask for `folder` to be listed. A repeat request for the folder that
    /// was requested last is ignored unless `reload` is set.
    pub fn update(&self, folder: &Path, reload: bool) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return false;
        }
        if !reload && state.current.as_deref() == Some(folder) {
            trace!(?folder, "Folder already requested");
            return false;
        }

        state.current = Some(folder.to_path_buf());
        state.pending = Some((folder.to_path_buf(), reload));
        state.generation += 1;
        self.shared.wake.notify_one();
        true
    }

    pub fn current_folder(&self) -> Option<PathBuf> {
        self.shared.state.lock().current.clone()
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.pending = None;
            self.shared.wake.notify_all();
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("Folder worker stopped");
    }
}

impl Drop for FolderWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>, enumerator: Arc<dyn FileEnumerator>, listener: FolderListener) {
    debug!("Folder worker started");
    let mut state = shared.state.lock();

    loop {
        if state.stopped {
            break;
        }
        let Some((folder, reload)) = state.pending.take() else {
            shared.wake.wait(&mut state);
            continue;
        };
        let generation = state.generation;
        drop(state);

        let files = enumerator.enumerate(&folder);
        if let Err(e) = &files {
            warn!(?folder, error = %e, "Failed to list folder");
        }

        state = shared.state.lock();
        if state.stopped {
            break;
        }
        if state.generation != generation {
            trace!(?folder, "Listing superseded by a newer request");
            continue;
        }
        drop(state);

        listener(FolderListing {
            folder,
            reload,
            files,
        });
        state = shared.state.lock();
    }
}
