//! Preallocated, recyclable handler pools.
//!
//! A [`SessionPool`] constructs a fixed set of handlers (and their work
//! objects, via the configured [`WorkAllocator`]) up front, hands them out
//! on accept or connect, and takes them back when sessions close. Under
//! steady load no per-connection allocation happens at all; a burst beyond
//! the preallocated set allocates extra handlers that then stay in the pool.
//! The instantaneous in-use count doubles as the load hint that sizes the
//! elastic work pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::session::{SessionHandler, SessionRef};
use crate::work::WorkAllocator;

/// A pool of recyclable session handlers.
pub struct SessionPool {
    config: PoolConfig,
    allocator: Arc<dyn WorkAllocator>,
    free: Mutex<Vec<Arc<SessionHandler>>>,
    /// Checked-out handlers, for load reporting and shutdown.
    active: Mutex<HashMap<u64, Arc<SessionHandler>>>,
    in_use: AtomicUsize,
    /// Handlers ever constructed; stays at the preallocated count unless
    /// concurrency exceeds it.
    created: AtomicUsize,
    next_id: AtomicU64,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl SessionPool {
    /// Create a pool. Handlers are not constructed until [`init`](Self::init).
    pub fn new(config: PoolConfig, allocator: Arc<dyn WorkAllocator>) -> Result<Arc<Self>, Error> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            allocator,
            free: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            in_use: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Preallocate the configured handlers and their work objects. Called by
    /// server/client construction; repeated calls are no-ops.
    pub fn init(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut free = self.free.lock();
        for _ in 0..self.config.preallocated_sessions {
            free.push(self.new_handler());
        }
        debug!(
            preallocated = self.config.preallocated_sessions,
            "session pool initialized"
        );
    }

    fn new_handler(self: &Arc<Self>) -> Arc<SessionHandler> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        SessionHandler::new(
            id,
            Arc::downgrade(self),
            &self.config,
            self.allocator.allocate(),
        )
    }

    /// Check out a handler bound to the given loops. Recycled handlers are
    /// preferred; an empty free list allocates a fresh one (callers throttle
    /// through the elastic work pool, not here).
    pub fn get(self: &Arc<Self>, io_loop: EventLoop, work_loop: EventLoop) -> SessionRef {
        let handler = {
            let mut free = self.free.lock();
            free.pop()
        }
        .unwrap_or_else(|| self.new_handler());

        let session = handler.checkout(io_loop, work_loop);
        self.active.lock().insert(handler.id(), handler);
        self.in_use.fetch_add(1, Ordering::AcqRel);
        session
    }

    /// Return a handler after its session fully closed. Clears per-session
    /// state (the work object's residual state via `on_clear` included) and
    /// pushes it back for reuse. Safe against duplicate returns.
    pub fn put(&self, handler: Arc<SessionHandler>) {
        if self.active.lock().remove(&handler.id()).is_none() {
            return;
        }
        handler.reset_for_recycle();
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        if !self.closed.load(Ordering::Acquire) {
            self.free.lock().push(handler);
        }
    }

    /// Instantaneous in-use count, consumed as the work pool's load hint.
    pub fn load(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Handlers currently waiting in the free list.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Handlers ever constructed by this pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Initiate a clean close on every live session. Used by graceful server
    /// shutdown; the sessions recycle through their normal close paths.
    /// Returns how many sessions were asked to close.
    pub fn close_active(&self) -> usize {
        let handlers: Vec<Arc<SessionHandler>> = self.active.lock().values().cloned().collect();
        let count = handlers.len();
        for handler in handlers {
            handler.current_ref().close();
        }
        count
    }

    /// Drain the free list, destroying handlers and their work objects.
    /// Handlers still out recycle to the floor when they return.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.free.lock().clear();
    }
}
