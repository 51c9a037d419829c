//! Application extension points.
//!
//! A *work object* holds the application side of one session: the callbacks
//! invoked as bytes arrive and leave, and whatever per-session state the
//! application needs between them. Work objects are constructed once per
//! preallocated handler by a [`WorkAllocator`] and live as long as the
//! handler, surviving recycling; [`SessionWork::on_clear`] is the hook that
//! erases residual state between sessions.
//!
//! All callbacks run on the session's work loop, one at a time, with the
//! session borrowed for the duration of the call. Callbacks must not block:
//! the work pool grows under load, but a blocking callback still stalls
//! every other session pinned to the same loop.

use crate::error::Error;
use crate::peer::PeerEvent;
use crate::session::SessionRef;

/// Per-session application callbacks.
///
/// Only `on_open`, `on_read`, `on_write`, and `on_close` are required; the
/// peer-event and lifecycle hooks default to no-ops for services that never
/// pair sessions.
pub trait SessionWork: Send + 'static {
    /// The session is established. Typically arms the first read.
    fn on_open(&mut self, session: &SessionRef);

    /// A read completed with `n` bytes in the session's read buffer.
    fn on_read(&mut self, session: &SessionRef, n: usize);

    /// A write completed; `n` bytes left the write buffer.
    fn on_write(&mut self, session: &SessionRef, n: usize);

    /// The session is over. `err` is `None` for a locally initiated close.
    /// This is the last callback of the session.
    fn on_close(&mut self, session: &SessionRef, err: Option<&Error>);

    /// An event arrived from the parent session.
    fn on_parent(&mut self, session: &SessionRef, event: PeerEvent) {
        let _ = (session, event);
    }

    /// An event arrived from the child session.
    fn on_child(&mut self, session: &SessionRef, event: PeerEvent) {
        let _ = (session, event);
    }

    /// The handler is being recycled; drop any residual per-session state.
    /// The framework resets its own fields but never touches application
    /// state.
    fn on_clear(&mut self) {}

    /// This session was just linked under a parent.
    fn on_set_parent(&mut self, session: &SessionRef) {
        let _ = session;
    }

    /// This session was just given a child.
    fn on_set_child(&mut self, session: &SessionRef) {
        let _ = session;
    }
}

/// Constructs one work object per preallocated handler.
///
/// Allocators are shared across the pool and may carry configuration or
/// shared services the work objects need (an upstream client, counters, a
/// routing table).
pub trait WorkAllocator: Send + Sync + 'static {
    fn allocate(&self) -> Box<dyn SessionWork>;
}

/// Build an allocator from a closure.
///
/// ```rust,ignore
/// let allocator = work::allocator_fn(|| EchoWork::default());
/// ```
pub fn allocator_fn<W, F>(f: F) -> FnAllocator<F>
where
    W: SessionWork,
    F: Fn() -> W + Send + Sync + 'static,
{
    FnAllocator { f }
}

/// Allocator wrapping a `Fn() -> W` closure. Built by [`allocator_fn`].
pub struct FnAllocator<F> {
    f: F,
}

impl<W, F> WorkAllocator for FnAllocator<F>
where
    W: SessionWork,
    F: Fn() -> W + Send + Sync + 'static,
{
    fn allocate(&self) -> Box<dyn SessionWork> {
        Box::new((self.f)())
    }
}
