//! Fixed-size loop pools with round-robin checkout.
//!
//! A [`LoopPool`] owns an ordered set of [`EventLoop`]s and hands them out
//! round-robin. The server keeps three of these tiers apart (acceptor
//! loops, I/O loops, work loops) so a slow application callback can never
//! starve accepts or stall another connection's reads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::error::Error;
use crate::event_loop::EventLoop;

/// A fixed group of event loops, one worker thread each.
///
/// Cheap to clone; clones share the pool. Starting an already started pool
/// and stopping an already stopped one are both no-ops.
#[derive(Clone)]
pub struct LoopPool {
    inner: Arc<PoolCore>,
}

struct PoolCore {
    loops: Vec<EventLoop>,
    cursor: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    started: AtomicBool,
}

impl LoopPool {
    /// Build a pool of `size` loops (at least one).
    pub fn new(size: usize) -> Result<Self, Error> {
        let size = size.max(1);
        let mut loops = Vec::with_capacity(size);
        for _ in 0..size {
            loops.push(EventLoop::new()?);
        }
        Ok(Self {
            inner: Arc::new(PoolCore {
                loops,
                cursor: AtomicUsize::new(0),
                threads: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Number of loops in the pool.
    pub fn len(&self) -> usize {
        self.inner.loops.len()
    }

    /// True when the pool has no loops. Never the case in practice; the
    /// constructor enforces a minimum of one.
    pub fn is_empty(&self) -> bool {
        self.inner.loops.is_empty()
    }

    /// Next loop in round-robin order. Thread-safe; the cursor wraps.
    pub fn get_loop(&self) -> EventLoop {
        let idx = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % self.inner.loops.len();
        self.inner.loops[idx].clone()
    }

    /// Loop at a fixed index. Acceptors are partitioned one-per-loop and
    /// must not share, so the server addresses acceptor loops by index.
    pub fn loop_at(&self, idx: usize) -> EventLoop {
        self.inner.loops[idx].clone()
    }

    /// Spawn one worker thread per loop. Non-blocking; returns once every
    /// thread is launched. No-op when already started.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.inner.threads.lock();
        for event_loop in &self.inner.loops {
            event_loop.reset_for_start();
            let el = event_loop.clone();
            threads.push(thread::spawn(move || el.run()));
        }
    }

    /// Drive the pool on the calling thread: worker threads for every loop
    /// but the first, the first loop on the caller. Blocks until the pool is
    /// stopped, then joins the workers.
    pub fn run(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for event_loop in &self.inner.loops {
            event_loop.reset_for_start();
        }
        {
            let mut threads = self.inner.threads.lock();
            for event_loop in self.inner.loops.iter().skip(1) {
                let el = event_loop.clone();
                threads.push(thread::spawn(move || el.run()));
            }
        }
        self.inner.loops[0].run();
        self.join_workers();
        self.inner.started.store(false, Ordering::Release);
    }

    /// Ask every loop to exit once its queue drains. Does not join; pair
    /// with [`run`](Self::run) (which joins on return) or [`stop`](Self::stop).
    pub fn request_stop(&self) {
        for event_loop in &self.inner.loops {
            event_loop.request_stop();
        }
    }

    /// Cooperative stop: request exit on every loop and join the workers.
    /// Queued tasks finish first. No-op when already stopped.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.request_stop();
        self.join_workers();
    }

    /// Forced stop: cancel outstanding tasks and join promptly.
    pub fn force_stop(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        for event_loop in &self.inner.loops {
            event_loop.force_stop();
        }
        self.join_workers();
    }

    /// True iff every loop's queue is empty and nothing is executing.
    pub fn is_idle(&self) -> bool {
        self.inner.loops.iter().all(EventLoop::is_idle)
    }

    fn join_workers(&self) {
        let handles: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}
