//! Single-worker eviction queue.
//!
//! Caches hand removed values to this queue instead of dropping them under
//! their lock. The worker thread runs the eviction callback, so releasing a
//! decoded image never blocks cache mutation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::Sender;
use tracing::{debug, error, trace};

use crate::error::SchedulerError;

/// Callback invoked once per evicted value, on the eviction thread.
pub type EvictionCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

enum Message<T> {
    Evict(T),
    Flush(Sender<()>),
}

pub struct EvictionQueue<T: Send + 'static> {
    tx: Option<Sender<Message<T>>>,
    handle: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + 'static> EvictionQueue<T> {
    pub fn spawn(name: &str, callback: EvictionCallback<T>) -> Result<Self, SchedulerError> {
        let (tx, rx) = flume::unbounded::<Message<T>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);
        let thread_name = format!("evict-{}", name);

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!(thread = %thread_name, "Eviction worker started");
                for message in rx.iter() {
                    match message {
                        Message::Evict(value) => {
                            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                                || callback(value),
                            ));
                            if result.is_err() {
                                error!(thread = %thread_name, "Eviction callback panicked");
                            }
                            worker_pending.fetch_sub(1, Ordering::AcqRel);
                        }
                        Message::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!(thread = %thread_name, "Eviction worker stopped");
            })
            .map_err(|source| SchedulerError::Spawn {
                name: format!("evict-{}", name),
                source,
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            pending,
        })
    }

    /// Hand a removed value to the eviction thread.
    pub fn submit(&self, value: T) {
        let Some(tx) = &self.tx else {
            return;
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(flume::SendError(Message::Evict(value))) = tx.send(Message::Evict(value)) {
            // Worker is gone; release on the caller's thread instead.
            self.pending.fetch_sub(1, Ordering::AcqRel);
            trace!("Eviction worker unavailable, dropping inline");
            drop(value);
        }
    }

    /// Block until every value submitted before this call has been processed.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = flume::bounded(1);
        if tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Evictions submitted but not yet processed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Drop for EvictionQueue<T> {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish the backlog and exit.
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_callback_runs_once_per_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let queue = EvictionQueue::spawn("test", Arc::new(move |v: u32| sink.lock().push(v))).unwrap();

        for v in 0..10 {
            queue.submit(v);
        }
        queue.flush();

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_callback_runs_off_caller_thread() {
        let caller = thread::current().id();
        let other = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&other);
        let queue = EvictionQueue::spawn(
            "thread",
            Arc::new(move |_: ()| *sink.lock() = Some(thread::current().id())),
        )
        .unwrap();

        queue.submit(());
        queue.flush();
        assert_ne!(other.lock().unwrap(), caller);
    }

    #[test]
    fn test_drop_drains_backlog() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        {
            let queue = EvictionQueue::spawn(
                "drop",
                Arc::new(move |_: u8| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
            for _ in 0..5 {
                queue.submit(1);
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_panicking_callback_keeps_worker_alive() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let queue = EvictionQueue::spawn(
            "panic",
            Arc::new(move |v: u8| {
                if v == 0 {
                    panic!("boom");
                }
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        queue.submit(0);
        queue.submit(1);
        queue.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
