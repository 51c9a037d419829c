//! The elastic work pool.
//!
//! Application callbacks run on work loops, and the number of work loops
//! follows demand: every checkout carries a *load hint* (the count of
//! sessions currently in use), and the pool grows one loop at a time until
//! `ceil(load / thread_load)` loops exist or the high watermark is reached.
//! Growth is monotonic for the life of the pool: load spikes leave capacity
//! behind rather than thrash threads.
//!
//! Each started loop also carries a periodic no-op keep-alive so a briefly
//! empty queue does not let its worker wind down. Keep-alives are invisible
//! to idleness checks and exit when the pool stops.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Keep-alive tick period. Coarse on purpose; it only has to keep the
/// worker pinned, not keep time.
const KEEPALIVE_PERIOD: Duration = Duration::from_millis(250);

/// A loop pool that grows with reported load, up to a high watermark.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct WorkPool {
    inner: Arc<WorkPoolCore>,
}

struct WorkPoolCore {
    loops: RwLock<Vec<EventLoop>>,
    cursor: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Serializes growth; selection never takes it.
    grow: Mutex<()>,
    started: AtomicBool,
    high_watermark: usize,
    thread_load: usize,
}

impl WorkPool {
    /// Build a pool with `initial` loops, growable to `high_watermark`,
    /// targeting `thread_load` busy sessions per loop.
    pub fn new(initial: usize, high_watermark: usize, thread_load: usize) -> Result<Self, Error> {
        let initial = initial.max(1);
        let high_watermark = high_watermark.max(initial);
        let thread_load = thread_load.max(1);

        let mut loops = Vec::with_capacity(initial);
        for _ in 0..initial {
            loops.push(EventLoop::new()?);
        }
        Ok(Self {
            inner: Arc::new(WorkPoolCore {
                loops: RwLock::new(loops),
                cursor: AtomicUsize::new(0),
                threads: Mutex::new(Vec::new()),
                grow: Mutex::new(()),
                started: AtomicBool::new(false),
                high_watermark,
                thread_load,
            }),
        })
    }

    /// Current loop count. Non-decreasing while the pool lives.
    pub fn current_size(&self) -> usize {
        self.inner.loops.read().len()
    }

    /// The configured upper bound on loop count.
    pub fn high_watermark(&self) -> usize {
        self.inner.high_watermark
    }

    /// Next loop in round-robin order, growing the pool first when the load
    /// hint demands more loops than currently exist. Growth past the high
    /// watermark is silently clamped.
    pub fn get_loop(&self, load_hint: usize) -> EventLoop {
        let required = self.required_size(load_hint);
        if required > self.current_size() {
            self.grow_to(required);
        }
        let loops = self.inner.loops.read();
        let idx = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[idx].clone()
    }

    /// Loops needed for `load_hint` busy sessions, clamped to
    /// `[1, high_watermark]`.
    fn required_size(&self, load_hint: usize) -> usize {
        let needed = load_hint.div_ceil(self.inner.thread_load);
        needed.clamp(1, self.inner.high_watermark)
    }

    fn grow_to(&self, required: usize) {
        let _growth = self.inner.grow.lock();
        let current = self.current_size();
        if required <= current {
            return;
        }
        let started = self.inner.started.load(Ordering::Acquire);
        for _ in current..required {
            let event_loop = match EventLoop::new() {
                Ok(el) => el,
                Err(err) => {
                    // Growth is an optimization; existing loops absorb the load.
                    debug!("work pool growth failed, reusing existing loops: {err}");
                    return;
                }
            };
            if started {
                self.launch(&event_loop);
            }
            self.inner.loops.write().push(event_loop);
        }
        debug!(size = required, "work pool grew");
    }

    /// Spawn one worker thread per loop plus its keep-alive. No-op when
    /// already started.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let loops: Vec<_> = self.inner.loops.read().clone();
        for event_loop in &loops {
            self.launch(event_loop);
        }
    }

    fn launch(&self, event_loop: &EventLoop) {
        event_loop.reset_for_start();
        event_loop.submit_keepalive(KEEPALIVE_PERIOD);
        let el = event_loop.clone();
        self.inner.threads.lock().push(thread::spawn(move || el.run()));
    }

    /// Cooperative stop: queued callbacks finish, keep-alives exit, workers
    /// are joined. No-op when already stopped.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for event_loop in self.inner.loops.read().iter() {
            event_loop.request_stop();
        }
        self.join_workers();
    }

    /// Forced stop: outstanding callbacks are cancelled at their next
    /// suspension point.
    pub fn force_stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for event_loop in self.inner.loops.read().iter() {
            event_loop.force_stop();
        }
        self.join_workers();
    }

    /// True iff every loop is idle.
    pub fn is_idle(&self) -> bool {
        self.inner.loops.read().iter().all(EventLoop::is_idle)
    }

    fn join_workers(&self) {
        let handles: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_size_math() {
        let pool = WorkPool::new(2, 16, 64).unwrap();
        assert_eq!(pool.required_size(0), 1);
        assert_eq!(pool.required_size(1), 1);
        assert_eq!(pool.required_size(64), 1);
        assert_eq!(pool.required_size(65), 2);
        assert_eq!(pool.required_size(500), 8);
        // clamped at the high watermark
        assert_eq!(pool.required_size(10_000), 16);
    }

    #[test]
    fn test_growth_is_monotonic_and_clamped() {
        let pool = WorkPool::new(1, 4, 10).unwrap();
        assert_eq!(pool.current_size(), 1);

        pool.get_loop(25); // needs 3
        assert_eq!(pool.current_size(), 3);

        pool.get_loop(5); // needs 1; never shrinks
        assert_eq!(pool.current_size(), 3);

        pool.get_loop(1_000); // clamped to 4
        assert_eq!(pool.current_size(), 4);
    }

    #[test]
    fn test_grown_loops_run_tasks() {
        let pool = WorkPool::new(1, 4, 1).unwrap();
        pool.start();

        let hits = Arc::new(AtomicUsize::new(0));
        for i in 0..16 {
            let hits = hits.clone();
            // load hint climbs past the watermark; selection keeps working
            pool.get_loop(i).submit(async move {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        while !pool.is_idle() {
            thread::sleep(Duration::from_millis(1));
        }
        pool.stop();

        assert_eq!(hits.load(Ordering::SeqCst), 16);
        assert_eq!(pool.current_size(), 4);
    }

    #[test]
    fn test_keepalive_does_not_block_idle_or_stop() {
        let pool = WorkPool::new(2, 2, 1).unwrap();
        pool.start();
        // keep-alives are running but the pool still reports idle
        thread::sleep(Duration::from_millis(20));
        assert!(pool.is_idle());
        pool.stop();
        pool.stop(); // idempotent
    }
}
