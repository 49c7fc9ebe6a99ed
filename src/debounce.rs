//! Debounced job coalescing.
//!
//! A coalescer owns one background thread and one piece of work. Requests
//! arriving in a burst collapse into a single run; requests that arrive
//! while the work is running bump the dirty counter, and the run re-arms
//! itself when it finishes so the last request is never lost.
//!
//! Phases: `Idle -> Scheduled -> Running -> {Idle | Scheduled}`, and
//! `Stopped` once shut down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::error::SchedulerError;

/// Where a coalescer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescerPhase {
    /// Nothing scheduled, nothing running.
    Idle,
    /// A run is armed and waits for its deadline.
    Scheduled,
    /// The work is executing on the coalescer thread.
    Running,
    /// Shut down; requests are rejected.
    Stopped,
}

#[derive(Debug)]
struct State {
    /// When the next run starts, if one is scheduled.
    deadline: Option<Instant>,
    running: bool,
    /// An immediate run was asked for while the work was running.
    immediate: bool,
    stopped: bool,
}

struct Shared {
    name: String,
    dirty: AtomicU64,
    runs: AtomicU64,
    rearm_delay: Duration,
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn phase(&self) -> CoalescerPhase {
        let state = self.state.lock();
        if state.stopped {
            CoalescerPhase::Stopped
        } else if state.running {
            CoalescerPhase::Running
        } else if state.deadline.is_some() {
            CoalescerPhase::Scheduled
        } else {
            CoalescerPhase::Idle
        }
    }
}

/// Collapses bursts of requests into runs of one piece of work.
///
/// The work always runs on the coalescer's own thread. Dropping the handle
/// shuts the thread down.
pub struct DebounceCoalescer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl DebounceCoalescer {
    /// Spawn the coalescer thread. `rearm_delay` is used when a run ends
    /// with newer requests pending.
    pub fn spawn<F>(name: &str, rearm_delay: Duration, work: F) -> Result<Self, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.to_owned(),
            dirty: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            rearm_delay,
            state: Mutex::new(State {
                deadline: None,
                running: false,
                immediate: false,
                stopped: false,
            }),
            wake: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_name = format!("debounce-{}", name);
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_loop(thread_shared, work))
            .map_err(|source| SchedulerError::Spawn {
                name: thread_name,
                source,
            })?;
        let thread_id = handle.thread().id();

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
            thread_id,
        })
    }

    /// Record a change and make sure a run follows within `delay`.
    ///
    /// Only the first request of a burst arms the timer. While the work is
    /// running the request just marks the coalescer dirty. Returns false
    /// once shut down.
    pub fn on_request(&self, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return false;
        }
        self.shared.dirty.fetch_add(1, Ordering::AcqRel);
        if state.deadline.is_none() && !state.running {
            state.deadline = Some(Instant::now() + delay);
            trace!(coalescer = %self.shared.name, ?delay, "Scheduled run");
            self.shared.wake.notify_one();
        }
        true
    }

    /// Run as soon as possible, bypassing the debounce delay. Called while
    /// the work is running, the follow-up run skips the re-arm delay too.
    pub fn request_immediate(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return false;
        }
        self.shared.dirty.fetch_add(1, Ordering::AcqRel);
        if state.running {
            // The follow-up run starts as soon as this one ends.
            state.immediate = true;
        } else {
            state.deadline = Some(Instant::now());
            self.shared.wake.notify_one();
        }
        true
    }

    /// Current phase, read under the state lock.
    pub fn phase(&self) -> CoalescerPhase {
        self.shared.phase()
    }

    /// Requests received so far.
    pub fn dirty_count(&self) -> u64 {
        self.shared.dirty.load(Ordering::Acquire)
    }

    /// Completed runs of the work.
    pub fn run_count(&self) -> u64 {
        self.shared.runs.load(Ordering::Acquire)
    }

    /// Drop any scheduled run and stop the thread. Further requests are ignored.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.deadline = None;
            self.shared.wake.notify_all();
        }

        // The work itself may trigger shutdown; never join our own thread.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        debug!(coalescer = %self.shared.name, "Coalescer stopped");
    }
}

impl Drop for DebounceCoalescer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DebounceCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceCoalescer")
            .field("name", &self.shared.name)
            .field("phase", &self.phase())
            .field("dirty", &self.dirty_count())
            .field("runs", &self.run_count())
            .finish()
    }
}

fn run_loop<F: FnMut()>(shared: Arc<Shared>, mut work: F) {
    debug!(coalescer = %shared.name, "Coalescer started");
    let mut state = shared.state.lock();

    loop {
        if state.stopped {
            break;
        }

        let Some(deadline) = state.deadline else {
            shared.wake.wait(&mut state);
            continue;
        };
        if Instant::now() < deadline {
            shared.wake.wait_until(&mut state, deadline);
            continue;
        }

        state.deadline = None;
        state.running = true;
        state.immediate = false;
        let observed = shared.dirty.load(Ordering::Acquire);
        drop(state);

        if panic::catch_unwind(AssertUnwindSafe(&mut work)).is_err() {
            error!(coalescer = %shared.name, "Coalesced work panicked");
        }
        shared.runs.fetch_add(1, Ordering::AcqRel);

        state = shared.state.lock();
        state.running = false;
        if !state.stopped
            && state.deadline.is_none()
            && shared.dirty.load(Ordering::Acquire) > observed
        {
            let delay = if state.immediate {
                Duration::ZERO
            } else {
                shared.rearm_delay
            };
            trace!(coalescer = %shared.name, ?delay, "Dirtied during run, re-arming");
            state.deadline = Some(Instant::now() + delay);
        }
        state.immediate = false;
    }

    debug!(coalescer = %shared.name, "Coalescer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(name: &str, rearm: Duration) -> (DebounceCoalescer, Arc<Mutex<Vec<Instant>>>) {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&runs);
        let coalescer =
            DebounceCoalescer::spawn(name, rearm, move || sink.lock().push(Instant::now())).unwrap();
        (coalescer, runs)
    }

    #[test]
    fn test_burst_runs_once_after_first_delay() {
        let (coalescer, runs) = counting("burst", Duration::from_millis(50));
        let start = Instant::now();

        coalescer.on_request(Duration::from_millis(200));
        thread::sleep(Duration::from_millis(50));
        coalescer.on_request(Duration::from_millis(200));
        thread::sleep(Duration::from_millis(50));
        coalescer.on_request(Duration::from_millis(200));
        assert_eq!(coalescer.phase(), CoalescerPhase::Scheduled);

        thread::sleep(Duration::from_millis(400));
        let runs = runs.lock();
        assert_eq!(runs.len(), 1);
        let elapsed = runs[0].duration_since(start);
        assert!(elapsed >= Duration::from_millis(200), "ran after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(350), "ran after {:?}", elapsed);
        assert_eq!(coalescer.dirty_count(), 3);
        assert_eq!(coalescer.phase(), CoalescerPhase::Idle);
    }

    #[test]
    fn test_request_during_run_rearms() {
        let first_run = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = flume::unbounded();
        let counter = Arc::clone(&first_run);
        let coalescer = DebounceCoalescer::spawn("rearm", Duration::from_millis(20), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(100));
            }
        })
        .unwrap();

        coalescer.on_request(Duration::ZERO);
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(coalescer.phase(), CoalescerPhase::Running);

        // Long delay is ignored while running; the re-arm delay applies.
        coalescer.on_request(Duration::from_secs(10));
        thread::sleep(Duration::from_millis(400));
        assert_eq!(first_run.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.run_count(), 2);
    }

    #[test]
    fn test_last_state_is_observed() {
        let value = Arc::new(AtomicU64::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (source, sink) = (Arc::clone(&value), Arc::clone(&seen));
        let coalescer = DebounceCoalescer::spawn("latest", Duration::from_millis(10), move || {
            sink.lock().push(source.load(Ordering::SeqCst));
            thread::sleep(Duration::from_millis(15));
        })
        .unwrap();

        for i in 1..=50u64 {
            value.store(i, Ordering::SeqCst);
            coalescer.on_request(Duration::from_millis(5));
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(300));

        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&50));
        assert!(seen.len() < 50);
    }

    #[test]
    fn test_request_immediate_skips_delay() {
        let (coalescer, runs) = counting("immediate", Duration::from_millis(50));
        coalescer.on_request(Duration::from_secs(10));
        coalescer.request_immediate();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(runs.lock().len(), 1);
    }

    #[test]
    fn test_immediate_request_during_run_skips_rearm_delay() {
        let (started_tx, started_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded::<()>();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&runs);
        let coalescer = DebounceCoalescer::spawn("immediate-rearm", Duration::from_secs(5), move || {
            let first = sink.lock().is_empty();
            sink.lock().push(Instant::now());
            if first {
                let _ = started_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(2));
            }
        })
        .unwrap();

        coalescer.request_immediate();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(coalescer.request_immediate());
        let released = Instant::now();
        release_tx.send(()).unwrap();

        thread::sleep(Duration::from_millis(300));
        let runs = runs.lock();
        assert_eq!(runs.len(), 2);
        assert!(runs[1].duration_since(released) < Duration::from_secs(1));
    }

    #[test]
    fn test_plain_request_during_run_waits_for_rearm_delay() {
        let (started_tx, started_rx) = flume::unbounded();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let coalescer = DebounceCoalescer::spawn("plain-rearm", Duration::from_secs(5), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = started_tx.send(());
                thread::sleep(Duration::from_millis(50));
            }
        })
        .unwrap();

        coalescer.on_request(Duration::ZERO);
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        coalescer.on_request(Duration::ZERO);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.phase(), CoalescerPhase::Scheduled);
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let (coalescer, runs) = counting("stop", Duration::from_millis(10));
        coalescer.on_request(Duration::from_millis(100));
        coalescer.shutdown();

        assert_eq!(coalescer.phase(), CoalescerPhase::Stopped);
        assert!(!coalescer.on_request(Duration::ZERO));
        assert!(!coalescer.request_immediate());
        thread::sleep(Duration::from_millis(200));
        assert!(runs.lock().is_empty());
    }

    #[test]
    fn test_panicking_work_keeps_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let coalescer = DebounceCoalescer::spawn("panic", Duration::from_millis(10), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run fails");
            }
        })
        .unwrap();

        coalescer.on_request(Duration::ZERO);
        thread::sleep(Duration::from_millis(100));
        coalescer.on_request(Duration::ZERO);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
