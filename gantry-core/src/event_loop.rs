//! Single-threaded event loops.
//!
//! An [`EventLoop`] is one task queue pinned to one worker thread. Sockets
//! registered on a loop complete their I/O on that loop's thread and nowhere
//! else, which is what lets a session's socket operations (and separately
//! its application callbacks) run without locking against each other.
//!
//! Each loop owns a dedicated `current_thread` tokio runtime. Tasks may be
//! submitted from any thread; they execute once a worker thread drives the
//! loop with [`EventLoop::run`]. Stopping is cooperative by default: `run`
//! returns only after a stop has been requested *and* all submitted tasks
//! have finished, so callbacks never vanish mid-flight. A forced stop
//! cancels outstanding tasks at their next suspension point instead.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::error::Error;

/// How often a draining `run` re-checks its exit condition if a wakeup is
/// missed. Purely a backstop; normal exit is notification-driven.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// One single-threaded executor. Cheap to clone; clones share the loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopCore>,
}

struct LoopCore {
    runtime: tokio::runtime::Runtime,
    /// Tasks submitted and not yet finished. Keep-alive tasks are excluded.
    pending: AtomicUsize,
    stop_requested: AtomicBool,
    /// Woken on stop requests and task completions so `run` can re-check.
    wake: Notify,
    /// Flips to `true` on a forced stop; submitted tasks race against it.
    cancel: watch::Sender<bool>,
}

impl EventLoop {
    /// Build a loop. Fails only if the underlying runtime cannot be created,
    /// which is fatal at pool construction time.
    pub fn new() -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (cancel, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(LoopCore {
                runtime,
                pending: AtomicUsize::new(0),
                stop_requested: AtomicBool::new(false),
                wake: Notify::new(),
                cancel,
            }),
        })
    }

    /// Queue a task. May be called from any thread, before or after a worker
    /// starts driving the loop; tasks queued while no worker is running are
    /// held until the next [`run`](Self::run).
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = TaskGuard::new(self.inner.clone());
        let mut cancel = self.inner.cancel.subscribe();
        self.inner.runtime.handle().spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = task => {}
                _ = cancelled(&mut cancel) => {}
            }
        });
    }

    /// Queue a persistent task that does not count toward
    /// [`is_idle`](Self::is_idle) and exits when the loop stops. Used for
    /// the work pool's idle keep-alives.
    pub(crate) fn submit_keepalive(&self, period: Duration) {
        let core = self.inner.clone();
        let mut cancel = self.inner.cancel.subscribe();
        self.inner.runtime.handle().spawn(async move {
            loop {
                if core.stop_requested.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = cancelled(&mut cancel) => break,
                }
            }
        });
    }

    /// Drive the loop on the calling thread until a stop is requested and
    /// the queue has drained.
    pub fn run(&self) {
        let core = &*self.inner;
        core.runtime.block_on(async {
            loop {
                if core.stop_requested.load(Ordering::Acquire)
                    && core.pending.load(Ordering::Acquire) == 0
                {
                    break;
                }
                let notified = core.wake.notified();
                // Re-check after registering so a wakeup between the first
                // check and here is not lost.
                if core.stop_requested.load(Ordering::Acquire)
                    && core.pending.load(Ordering::Acquire) == 0
                {
                    break;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(DRAIN_POLL) => {}
                }
            }
        });
    }

    /// Ask `run` to return once the queue drains. Safe from any thread.
    pub fn request_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::Release);
        self.inner.wake.notify_waiters();
    }

    /// Ask `run` to return promptly, cancelling outstanding tasks at their
    /// next suspension point.
    pub fn force_stop(&self) {
        self.inner.cancel.send_replace(true);
        self.request_stop();
    }

    /// Clear stop state so the loop can be driven again. Tasks queued while
    /// the loop was stopped are retained and run on the next `run`.
    pub(crate) fn reset_for_start(&self) {
        self.inner.stop_requested.store(false, Ordering::Release);
        self.inner.cancel.send_replace(false);
    }

    /// True when no submitted task is queued or executing.
    pub fn is_idle(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire) == 0
    }

    /// Enter this loop's runtime context on the current thread, so that
    /// resources created here (listeners in particular) register with this
    /// loop's reactor.
    pub(crate) fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
        self.inner.runtime.enter()
    }

    /// Stable identity of the underlying loop, shared by all clones.
    pub(crate) fn loop_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

/// RAII pending-count holder for one submitted task.
struct TaskGuard {
    core: Arc<LoopCore>,
}

impl TaskGuard {
    fn new(core: Arc<LoopCore>) -> Self {
        core.pending.fetch_add(1, Ordering::AcqRel);
        Self { core }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.core.pending.fetch_sub(1, Ordering::AcqRel);
        self.core.wake.notify_waiters();
    }
}

/// Resolve once the watch flips to `true`. Never resolves if the sender is
/// gone: an orphaned task should park, not spuriously cancel.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
