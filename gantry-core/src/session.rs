//! Per-connection session handlers.
//!
//! A [`SessionHandler`] is the recyclable state behind one connection: the
//! socket halves, two fixed buffers, the owning work object, timer state,
//! and optional links to a paired session. Handlers are owned by their
//! [`SessionPool`](crate::SessionPool) and live across many sessions; a
//! checkout produces a [`SessionRef`] stamped with a fresh generation, and
//! everything the framework later posts on the handler's behalf carries that
//! stamp, so completions and peer events from a finished session can never
//! touch its successor.
//!
//! # Threading discipline
//!
//! Each handler is bound at checkout to one I/O loop and one work loop.
//! Socket operations run only on the I/O loop; work callbacks run only on
//! the work loop, one at a time. I/O completions do nothing but post events
//! to the work loop, so no session field is ever mutated from two loops at
//! once. Socket halves are *taken out* of the handler while an operation is
//! in flight, which is also what enforces "at most one outstanding read and
//! one outstanding write": a second arm finds the slot empty.
//!
//! # Shutdown
//!
//! The first of I/O error, peer close, timer expiry, or application
//! `close()` moves the session to `Closing` and wins; everything after is a
//! no-op. The close path cancels timers and in-flight operations, delivers
//! `on_close` as the final callback, signals the paired session (clearing
//! its own pointer first), drains pending completions, shuts the socket
//! down, and recycles the handler to its pool.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::buffer::SessionBuffer;
use crate::config::PoolConfig;
use crate::error::Error;
use crate::event_loop::{cancelled, EventLoop};
use crate::peer::PeerEvent;
use crate::session_pool::SessionPool;
use crate::transport::{BoxedStream, Transport};
use crate::work::SessionWork;

/// How often the recycle task re-checks for in-flight operations. They have
/// all been cancelled by the time it runs, so one or two ticks suffice.
const DRAIN_TICK: Duration = Duration::from_millis(1);

/// Session lifecycle state, compact for atomic storage.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// In the pool, available for checkout.
    Idle = 0,
    /// Checked out and (possibly) carrying traffic.
    Open = 1,
    /// Close initiated; callbacks and completions are winding down.
    Closing = 2,
    /// Socket released; about to re-enter the pool.
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Pool-owned state for one connection slot.
pub struct SessionHandler {
    id: u64,
    state: AtomicU8,
    /// Bumped on every checkout; stale refs and completions check it.
    generation: AtomicU64,
    /// Monotonic per session: flips to true at most once, on close.
    stopped: AtomicBool,
    /// True once `on_open` has been queued; gates later callbacks so
    /// nothing can run ahead of `on_open`.
    open_queued: AtomicBool,
    /// True once `on_open` has actually run; `on_close` fires only when it
    /// did, so the two always pair.
    open_delivered: AtomicBool,
    /// True once `on_close` has run; nothing is delivered after it.
    finalized: AtomicBool,
    /// In-flight socket operations and timers; recycling waits for zero.
    ops_in_flight: AtomicUsize,
    bindings: Mutex<LoopBindings>,
    io: Mutex<IoSlots>,
    work: Mutex<Box<dyn SessionWork>>,
    links: Mutex<PeerLinks>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    close_reason: Mutex<Option<Error>>,
    pool: Weak<SessionPool>,
    session_timeout: Duration,
    io_timeout: Duration,
}

#[derive(Default)]
struct LoopBindings {
    io_loop: Option<EventLoop>,
    work_loop: Option<EventLoop>,
}

struct IoSlots {
    read_half: Option<ReadHalf<BoxedStream>>,
    write_half: Option<WriteHalf<BoxedStream>>,
    read_buf: Option<SessionBuffer>,
    write_buf: Option<SessionBuffer>,
}

#[derive(Default)]
struct PeerLinks {
    parent: Option<PeerLink>,
    child: Option<PeerLink>,
}

/// Non-owning link to a paired session. The pools own their handlers; peers
/// hold weak references stamped with the peer's generation.
struct PeerLink {
    handler: Weak<SessionHandler>,
    generation: u64,
}

impl PeerLink {
    fn from_ref(session: &SessionRef) -> Self {
        Self {
            handler: Arc::downgrade(&session.handler),
            generation: session.generation,
        }
    }

    fn to_ref(&self) -> Option<SessionRef> {
        let handler = self.handler.upgrade()?;
        if handler.generation.load(Ordering::Acquire) != self.generation {
            return None;
        }
        Some(SessionRef {
            handler,
            generation: self.generation,
        })
    }

    fn is_for(&self, session: &SessionRef) -> bool {
        std::ptr::eq(self.handler.as_ptr(), Arc::as_ptr(&session.handler))
            && self.generation == session.generation
    }
}

impl SessionHandler {
    pub(crate) fn new(
        id: u64,
        pool: Weak<SessionPool>,
        config: &PoolConfig,
        work: Box<dyn SessionWork>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(SessionState::Idle as u8),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            open_queued: AtomicBool::new(false),
            open_delivered: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            ops_in_flight: AtomicUsize::new(0),
            bindings: Mutex::new(LoopBindings::default()),
            io: Mutex::new(IoSlots {
                read_half: None,
                write_half: None,
                read_buf: Some(SessionBuffer::new(config.read_buffer_size)),
                write_buf: Some(SessionBuffer::new(config.effective_write_buffer_size())),
            }),
            work: Mutex::new(work),
            links: Mutex::new(PeerLinks::default()),
            cancel: Mutex::new(None),
            close_reason: Mutex::new(None),
            pool,
            session_timeout: config.session_timeout,
            io_timeout: config.io_timeout,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bind loops and hand out a freshly stamped ref. Pool-internal.
    pub(crate) fn checkout(
        self: &Arc<Self>,
        io_loop: EventLoop,
        work_loop: EventLoop,
    ) -> SessionRef {
        debug_assert_eq!(self.state(), SessionState::Idle);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut bindings = self.bindings.lock();
            bindings.io_loop = Some(io_loop);
            bindings.work_loop = Some(work_loop);
        }
        let (tx, _) = watch::channel(false);
        *self.cancel.lock() = Some(tx);
        self.stopped.store(false, Ordering::Release);
        self.open_queued.store(false, Ordering::Release);
        self.open_delivered.store(false, Ordering::Release);
        self.finalized.store(false, Ordering::Release);
        self.state.store(SessionState::Open as u8, Ordering::Release);
        SessionRef {
            handler: self.clone(),
            generation,
        }
    }

    /// A ref stamped with the handler's current generation. Used by the
    /// pool to close live sessions at shutdown.
    pub(crate) fn current_ref(self: &Arc<Self>) -> SessionRef {
        SessionRef {
            handler: self.clone(),
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    /// Erase per-session state before the handler re-enters the free list.
    /// Buffers keep their storage; only logical lengths reset.
    pub(crate) fn reset_for_recycle(&self) {
        {
            let mut io = self.io.lock();
            io.read_half = None;
            io.write_half = None;
            if let Some(buf) = io.read_buf.as_mut() {
                buf.reset();
            }
            if let Some(buf) = io.write_buf.as_mut() {
                buf.reset();
            }
        }
        {
            let mut links = self.links.lock();
            links.parent = None;
            links.child = None;
        }
        {
            let mut bindings = self.bindings.lock();
            bindings.io_loop = None;
            bindings.work_loop = None;
        }
        *self.cancel.lock() = None;
        *self.close_reason.lock() = None;
        self.work.lock().on_clear();
        self.state.store(SessionState::Idle as u8, Ordering::Release);
    }

    fn teardown_socket(&self) {
        let mut io = self.io.lock();
        io.read_half = None;
        io.write_half = None;
    }
}

/// A checkout handle to one live session.
///
/// Cheap to clone; all operations are non-blocking and silently become
/// no-ops (or return [`Error::Cancelled`]) once the session they were
/// stamped for is over.
#[derive(Clone)]
pub struct SessionRef {
    handler: Arc<SessionHandler>,
    generation: u64,
}

/// Which callback a queued work task should deliver.
enum Callback {
    Open,
    Read(usize),
    Write(usize),
    Parent(PeerEvent),
    Child(PeerEvent),
    SetParent,
    SetChild,
}

impl SessionRef {
    /// Stable identifier of the underlying handler slot.
    pub fn handler_id(&self) -> u64 {
        self.handler.id
    }

    /// True while this ref's session is open: the handler has not been
    /// closed or recycled since the ref was issued.
    pub fn is_live(&self) -> bool {
        self.current_generation()
            && self.handler.state.load(Ordering::Acquire) == SessionState::Open as u8
    }

    /// True once the session has entered its close path.
    pub fn is_stopped(&self) -> bool {
        self.handler.stopped.load(Ordering::Acquire)
    }

    fn current_generation(&self) -> bool {
        self.handler.generation.load(Ordering::Acquire) == self.generation
    }

    fn io_loop(&self) -> Option<EventLoop> {
        self.handler.bindings.lock().io_loop.clone()
    }

    fn work_loop(&self) -> Option<EventLoop> {
        self.handler.bindings.lock().work_loop.clone()
    }

    fn cancel_rx(&self) -> Option<watch::Receiver<bool>> {
        self.handler.cancel.lock().as_ref().map(watch::Sender::subscribe)
    }

    // ========================================================================
    // I/O operations
    // ========================================================================

    /// Arm a single-shot read. On completion `on_read(n)` is posted to the
    /// work loop; zero bytes means the peer shut down and the session closes
    /// with [`Error::Eof`]. At most one read may be outstanding.
    pub fn read_some(&self) -> Result<(), Error> {
        if !self.is_live() {
            return Err(Error::Cancelled);
        }
        let (half, buf) = {
            let mut io = self.handler.io.lock();
            match (io.read_half.take(), io.read_buf.take()) {
                (Some(half), Some(buf)) => (half, buf),
                (half, buf) => {
                    io.read_half = half;
                    io.read_buf = buf;
                    return Err(Error::Busy);
                }
            }
        };
        let (Some(io_loop), Some(cancel)) = (self.io_loop(), self.cancel_rx()) else {
            let mut io = self.handler.io.lock();
            io.read_half = Some(half);
            io.read_buf = Some(buf);
            return Err(Error::Cancelled);
        };

        let session = self.clone();
        let io_timeout = self.handler.io_timeout;
        io_loop.submit(async move {
            let guard = OpGuard::new(session.handler.clone());
            let mut half = half;
            let mut buf = buf;
            let mut cancel = cancel;
            buf.reset();
            let outcome = {
                let op = async { half.read(buf.storage_mut()).await };
                tokio::pin!(op);
                run_io(io_timeout, &mut cancel, op).await
            };
            match outcome {
                IoOutcome::Done(Ok(0)) => {
                    session.return_read(None, buf);
                    session.close_with_reason(Some(Error::Eof));
                }
                IoOutcome::Done(Ok(n)) => {
                    buf.set_filled(n);
                    session.return_read(Some(half), buf);
                    session.dispatch(Callback::Read(n));
                }
                IoOutcome::Done(Err(err)) => {
                    session.return_read(None, buf);
                    session.close_with_reason(Some(Error::from_io(err)));
                }
                IoOutcome::TimedOut => {
                    session.return_read(None, buf);
                    session.close_with_reason(Some(Error::TimedOut));
                }
                IoOutcome::Cancelled => {
                    session.return_read(None, buf);
                }
            }
            drop(guard);
        });
        Ok(())
    }

    /// Copy `data` into the fixed write buffer and write it out. On
    /// completion `on_write(n)` is posted to the work loop. Payloads larger
    /// than the write buffer close the session with
    /// [`Error::NoBufferSpace`]. At most one write may be outstanding.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        if !self.is_live() {
            return Err(Error::Cancelled);
        }
        let (half, mut buf) = {
            let mut io = self.handler.io.lock();
            match (io.write_half.take(), io.write_buf.take()) {
                (Some(half), Some(buf)) => (half, buf),
                (half, buf) => {
                    io.write_half = half;
                    io.write_buf = buf;
                    return Err(Error::Busy);
                }
            }
        };
        if !buf.fill(data) {
            {
                let mut io = self.handler.io.lock();
                io.write_half = Some(half);
                io.write_buf = Some(buf);
            }
            self.close_with_reason(Some(Error::NoBufferSpace));
            return Err(Error::NoBufferSpace);
        }
        self.spawn_write(half, buf)
    }

    /// Write the first `n` filled bytes of `source`'s read buffer to this
    /// session's socket. `source` may be this session itself (echo) or its
    /// peer (proxy forwarding); the bytes are staged through this session's
    /// own write buffer either way, so the source buffer is free again as
    /// soon as this returns.
    pub fn write_from(&self, source: &SessionRef, n: usize) -> Result<(), Error> {
        if !self.is_live() {
            return Err(Error::Cancelled);
        }
        if !source.current_generation() {
            return Err(Error::Cancelled);
        }

        let staged = if Arc::ptr_eq(&self.handler, &source.handler) {
            let mut io = self.handler.io.lock();
            stage_echo(&mut io, n)
        } else {
            // Opposite-direction forwards stage concurrently from each
            // other's buffers; a fixed lock order keeps them deadlock-free.
            // Handler ids are only unique within one pool, so order by
            // allocation address instead.
            let own_first =
                (Arc::as_ptr(&self.handler) as usize) < (Arc::as_ptr(&source.handler) as usize);
            let (lower, upper) = if own_first {
                (&self.handler, &source.handler)
            } else {
                (&source.handler, &self.handler)
            };
            let mut lower_io = lower.io.lock();
            let mut upper_io = upper.io.lock();
            if own_first {
                stage_forward(&mut lower_io, &upper_io, n)
            } else {
                stage_forward(&mut upper_io, &lower_io, n)
            }
        };
        match staged {
            Ok((half, buf)) => self.spawn_write(half, buf),
            Err(Error::NoBufferSpace) => {
                self.close_with_reason(Some(Error::NoBufferSpace));
                Err(Error::NoBufferSpace)
            }
            Err(err) => Err(err),
        }
    }

    fn spawn_write(
        &self,
        half: WriteHalf<BoxedStream>,
        buf: SessionBuffer,
    ) -> Result<(), Error> {
        let (Some(io_loop), Some(cancel)) = (self.io_loop(), self.cancel_rx()) else {
            let mut io = self.handler.io.lock();
            io.write_half = Some(half);
            io.write_buf = Some(buf);
            return Err(Error::Cancelled);
        };

        let session = self.clone();
        let io_timeout = self.handler.io_timeout;
        io_loop.submit(async move {
            let guard = OpGuard::new(session.handler.clone());
            let mut half = half;
            let buf = buf;
            let mut cancel = cancel;
            let outcome = {
                let op = async { half.write_all(buf.filled()).await.map(|()| buf.len()) };
                tokio::pin!(op);
                run_io(io_timeout, &mut cancel, op).await
            };
            match outcome {
                IoOutcome::Done(Ok(n)) => {
                    session.return_write(Some(half), buf);
                    session.dispatch(Callback::Write(n));
                }
                IoOutcome::Done(Err(err)) => {
                    session.return_write(None, buf);
                    session.close_with_reason(Some(Error::from_io(err)));
                }
                IoOutcome::TimedOut => {
                    session.return_write(None, buf);
                    session.close_with_reason(Some(Error::TimedOut));
                }
                IoOutcome::Cancelled => {
                    session.return_write(None, buf);
                }
            }
            drop(guard);
        });
        Ok(())
    }

    /// Borrow the filled region of the read buffer, available between a read
    /// completion and the next arm. Returns `None` if the session is gone or
    /// a read is in flight.
    ///
    /// The session's I/O state is locked for the duration of the closure:
    /// inspect or copy the bytes, but do not invoke session operations from
    /// inside it. To write these bytes out, use
    /// [`write_from`](Self::write_from), which does its own staging.
    pub fn with_read_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if !self.current_generation() {
            return None;
        }
        let io = self.handler.io.lock();
        io.read_buf.as_ref().map(|buf| f(buf.filled()))
    }

    fn return_read(&self, half: Option<ReadHalf<BoxedStream>>, buf: SessionBuffer) {
        let mut io = self.handler.io.lock();
        io.read_half = half;
        io.read_buf = Some(buf);
    }

    fn return_write(&self, half: Option<WriteHalf<BoxedStream>>, buf: SessionBuffer) {
        let mut io = self.handler.io.lock();
        io.write_half = half;
        io.write_buf = Some(buf);
    }

    // ========================================================================
    // Paired-session operations
    // ========================================================================

    /// Deliver an event from this session's parent: queues
    /// `on_parent(event)` on this session's work loop.
    pub fn post_parent(&self, event: PeerEvent) {
        self.dispatch(Callback::Parent(event));
    }

    /// Deliver an event from this session's child: queues
    /// `on_child(event)` on this session's work loop.
    pub fn post_child(&self, event: PeerEvent) {
        self.dispatch(Callback::Child(event));
    }

    /// The parent session, while linked and still on the same session.
    pub fn parent(&self) -> Option<SessionRef> {
        self.handler.links.lock().parent.as_ref().and_then(PeerLink::to_ref)
    }

    /// The child session, while linked and still on the same session.
    pub fn child(&self) -> Option<SessionRef> {
        self.handler.links.lock().child.as_ref().and_then(PeerLink::to_ref)
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close the session cleanly. Idempotent; the first close (from any
    /// source) wins.
    pub fn close(&self) {
        self.close_with_reason(None);
    }

    /// Close the session, reporting `err` to `on_close`.
    pub fn close_with(&self, err: Error) {
        self.close_with_reason(Some(err));
    }

    fn close_with_reason(&self, err: Option<Error>) {
        if !self.current_generation() {
            return;
        }
        if self
            .handler
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.handler.stopped.store(true, Ordering::Release);
        *self.handler.close_reason.lock() = err;
        if let Some(tx) = self.handler.cancel.lock().as_ref() {
            tx.send_replace(true);
        }
        let Some(work_loop) = self.work_loop() else {
            return;
        };
        let session = self.clone();
        work_loop.submit(async move {
            session.finalize();
        });
    }

    /// Runs on the work loop. Delivers the final callback, breaks the peer
    /// cycle, then hands off to the I/O loop to drain and recycle.
    fn finalize(&self) {
        let reason = self.handler.close_reason.lock().take();
        if self.handler.open_delivered.load(Ordering::Acquire) {
            let mut work = self.handler.work.lock();
            work.on_close(self, reason.as_ref());
        }
        self.handler.finalized.store(true, Ordering::Release);
        // Clear own pointers before signalling, so the weak cycle is broken
        // even if the peer never processes the event.
        let (parent, child) = {
            let mut links = self.handler.links.lock();
            (links.parent.take(), links.child.take())
        };
        if let Some(peer) = parent.as_ref().and_then(PeerLink::to_ref) {
            peer.post_child(PeerEvent::ChildClose);
        }
        if let Some(peer) = child.as_ref().and_then(PeerLink::to_ref) {
            peer.post_parent(PeerEvent::ParentClose);
        }
        if let Some(err) = reason {
            if err.should_log() {
                warn!(session = self.handler.id, error = %err, "session closed on error");
            }
        }

        let Some(io_loop) = self.io_loop() else {
            return;
        };
        let session = self.clone();
        io_loop.submit(async move {
            while session.handler.ops_in_flight.load(Ordering::Acquire) > 0 {
                tokio::time::sleep(DRAIN_TICK).await;
            }
            session.handler.teardown_socket();
            session
                .handler
                .state
                .store(SessionState::Closed as u8, Ordering::Release);
            if let Some(pool) = session.handler.pool.upgrade() {
                pool.put(session.handler.clone());
            }
        });
    }

    /// Recycle a handler whose session never delivered `on_open`: failed
    /// accepts, failed connects, shutdown races. No callbacks fire. If a
    /// regular close already won the state transition, its close path owns
    /// the recycle and this is a no-op.
    pub(crate) fn abort_unopened(&self) {
        if !self.current_generation() {
            return;
        }
        if self
            .handler
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.handler.stopped.store(true, Ordering::Release);
        if let Some(tx) = self.handler.cancel.lock().as_ref() {
            tx.send_replace(true);
        }
        self.handler.teardown_socket();
        self.handler
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
        if let Some(pool) = self.handler.pool.upgrade() {
            pool.put(self.handler.clone());
        }
    }

    // ========================================================================
    // Session startup (framework-internal)
    // ========================================================================

    /// Bring up an accepted connection: register the socket on this
    /// session's I/O loop, run the transport hook, deliver `on_open`, arm
    /// the session timer.
    pub(crate) fn start_inbound(
        &self,
        stream: std::net::TcpStream,
        transport: Arc<dyn Transport>,
        nodelay: bool,
    ) {
        let Some(io_loop) = self.io_loop() else {
            self.abort_unopened();
            return;
        };
        let session = self.clone();
        io_loop.submit(async move {
            let guard = OpGuard::new(session.handler.clone());
            let Some(mut cancel) = session.cancel_rx() else {
                drop(guard);
                session.abort_unopened();
                return;
            };
            let outcome = {
                let setup = async {
                    let stream = TcpStream::from_std(stream)?;
                    if nodelay {
                        stream.set_nodelay(true)?;
                    }
                    transport.accept(stream).await
                };
                tokio::pin!(setup);
                tokio::select! {
                    _ = cancelled(&mut cancel) => None,
                    res = setup => Some(res),
                }
            };
            match outcome {
                Some(Ok(stream)) => session.open_with(stream),
                Some(Err(err)) => {
                    debug!(session = session.handler.id, error = %err, "inbound setup failed");
                    session.abort_unopened();
                }
                None => session.abort_unopened(),
            }
            // Held through setup so a concurrent close cannot recycle the
            // handler out from under the stream installation.
            drop(guard);
        });
    }

    /// Bring up an outbound connection for `parent`: connect under the
    /// deadline, run the transport hook, wire the pair, deliver `on_open`.
    /// Failure reports `ChildClose` to the parent and recycles this handler
    /// without opening it.
    pub(crate) fn start_outbound(
        &self,
        addr: SocketAddr,
        transport: Arc<dyn Transport>,
        parent: SessionRef,
        connect_timeout: Duration,
        nodelay: bool,
    ) {
        let Some(io_loop) = self.io_loop() else {
            parent.post_child(PeerEvent::ChildClose);
            self.abort_unopened();
            return;
        };
        let session = self.clone();
        io_loop.submit(async move {
            let guard = OpGuard::new(session.handler.clone());
            let Some(mut cancel) = session.cancel_rx() else {
                drop(guard);
                parent.post_child(PeerEvent::ChildClose);
                session.abort_unopened();
                return;
            };
            let outcome = {
                let setup = async {
                    let stream = match deadline(connect_timeout, TcpStream::connect(addr)).await {
                        Some(res) => res?,
                        None => {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "connect timed out",
                            ))
                        }
                    };
                    if nodelay {
                        stream.set_nodelay(true)?;
                    }
                    transport.connect(stream).await
                };
                tokio::pin!(setup);
                tokio::select! {
                    _ = cancelled(&mut cancel) => None,
                    res = setup => Some(res),
                }
            };
            match outcome {
                Some(Ok(stream)) => {
                    if !parent.is_live() {
                        drop(guard);
                        session.abort_unopened();
                        return;
                    }
                    session.install_stream(stream);
                    if !link_pair(&parent, &session) {
                        // either side lost its session while we were
                        // connecting; nothing was wired
                        drop(guard);
                        session.abort_unopened();
                        return;
                    }
                    session.mark_opened();
                    session.dispatch(Callback::Open);
                    session.arm_session_timer();
                    drop(guard);
                    // The parent may have closed while we were wiring; its
                    // close path could have missed the fresh child link.
                    if !parent.is_live() {
                        session.close();
                    }
                }
                Some(Err(err)) => {
                    debug!(session = session.handler.id, error = %Error::Connect(err), "outbound setup failed");
                    parent.post_child(PeerEvent::ChildClose);
                    drop(guard);
                    session.abort_unopened();
                }
                None => {
                    parent.post_child(PeerEvent::ChildClose);
                    drop(guard);
                    session.abort_unopened();
                }
            }
        });
    }

    fn open_with(&self, stream: BoxedStream) {
        self.install_stream(stream);
        self.mark_opened();
        self.dispatch(Callback::Open);
        self.arm_session_timer();
    }

    fn install_stream(&self, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut io = self.handler.io.lock();
        io.read_half = Some(read_half);
        io.write_half = Some(write_half);
    }

    fn mark_opened(&self) {
        self.handler.open_queued.store(true, Ordering::Release);
    }

    fn arm_session_timer(&self) {
        let timeout = self.handler.session_timeout;
        if timeout.is_zero() {
            return;
        }
        let (Some(io_loop), Some(mut cancel)) = (self.io_loop(), self.cancel_rx()) else {
            return;
        };
        let session = self.clone();
        io_loop.submit(async move {
            let _guard = OpGuard::new(session.handler.clone());
            tokio::select! {
                _ = cancelled(&mut cancel) => {}
                _ = tokio::time::sleep(timeout) => {
                    session.close_with(Error::TimedOut);
                }
            }
        });
    }

    // ========================================================================
    // Callback dispatch
    // ========================================================================

    fn dispatch(&self, callback: Callback) {
        let Some(work_loop) = self.work_loop() else {
            return;
        };
        let session = self.clone();
        work_loop.submit(async move {
            session.run_callback(callback);
        });
    }

    /// Runs on the work loop; the single place application callbacks fire.
    ///
    /// Gates, in order: the ref must still name the current session;
    /// `on_close` must not have run yet (it is the last callback); the
    /// handler must be in-session (callbacks queued behind an initiated
    /// close still run, *before* the also-queued finalize); and nothing but
    /// `on_open` and the pairing hooks may run before `on_open` is queued.
    fn run_callback(&self, callback: Callback) {
        if !self.current_generation() || self.handler.finalized.load(Ordering::Acquire) {
            return;
        }
        if matches!(
            self.handler.state(),
            SessionState::Idle | SessionState::Closed
        ) {
            return;
        }
        if !self.handler.open_queued.load(Ordering::Acquire)
            && !matches!(
                callback,
                Callback::Open | Callback::SetParent | Callback::SetChild
            )
        {
            return;
        }
        let mut work = self.handler.work.lock();
        match callback {
            Callback::Open => {
                self.handler.open_delivered.store(true, Ordering::Release);
                work.on_open(self);
            }
            Callback::Read(n) => work.on_read(self, n),
            Callback::Write(n) => work.on_write(self, n),
            Callback::Parent(event) => work.on_parent(self, event),
            Callback::Child(event) => work.on_child(self, event),
            Callback::SetParent => work.on_set_parent(self),
            Callback::SetChild => work.on_set_child(self),
        }
    }
}

/// Wire `parent` and `child` symmetrically and fire the pairing hooks.
///
/// Each side is linked only while it is still on the session its ref was
/// stamped for, checked under that side's link lock. A handler that closed,
/// recycled, and was reissued between the caller's liveness check and the
/// write here can therefore never inherit a stale link. Returns false, with
/// neither side left linked, when either side lost its session.
pub(crate) fn link_pair(parent: &SessionRef, child: &SessionRef) -> bool {
    {
        let mut links = parent.handler.links.lock();
        if !parent.is_live() {
            return false;
        }
        links.child = Some(PeerLink::from_ref(child));
    }
    let child_linked = {
        let mut links = child.handler.links.lock();
        if child.is_live() {
            links.parent = Some(PeerLink::from_ref(parent));
            true
        } else {
            false
        }
    };
    if !child_linked {
        // Back out the half-wired parent side, but only if it still points
        // at this child; the parent may have moved on already.
        let mut links = parent.handler.links.lock();
        if parent.current_generation()
            && links.child.as_ref().is_some_and(|link| link.is_for(child))
        {
            links.child = None;
        }
        return false;
    }
    parent.dispatch(Callback::SetChild);
    child.dispatch(Callback::SetParent);
    true
}

/// RAII in-flight-operation marker; recycling waits for these to drop.
struct OpGuard {
    handler: Arc<SessionHandler>,
}

impl OpGuard {
    fn new(handler: Arc<SessionHandler>) -> Self {
        handler.ops_in_flight.fetch_add(1, Ordering::AcqRel);
        Self { handler }
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.handler.ops_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Stage a same-session write: copy from the session's own read buffer into
/// its write buffer and take the write side, ready to arm.
fn stage_echo(
    io: &mut IoSlots,
    n: usize,
) -> Result<(WriteHalf<BoxedStream>, SessionBuffer), Error> {
    let (half, mut buf) = match (io.write_half.take(), io.write_buf.take()) {
        (Some(half), Some(buf)) => (half, buf),
        (half, buf) => {
            io.write_half = half;
            io.write_buf = buf;
            return Err(Error::Busy);
        }
    };
    let Some(src) = io.read_buf.as_ref() else {
        io.write_half = Some(half);
        io.write_buf = Some(buf);
        return Err(Error::Busy);
    };
    let count = n.min(src.len());
    let copied = buf.fill(&src.filled()[..count]);
    if !copied {
        io.write_half = Some(half);
        io.write_buf = Some(buf);
        return Err(Error::NoBufferSpace);
    }
    Ok((half, buf))
}

/// Stage a cross-session forward: copy from the peer's read buffer into this
/// session's write buffer. Both locks are held by the caller.
fn stage_forward(
    own: &mut IoSlots,
    src: &IoSlots,
    n: usize,
) -> Result<(WriteHalf<BoxedStream>, SessionBuffer), Error> {
    let (half, mut buf) = match (own.write_half.take(), own.write_buf.take()) {
        (Some(half), Some(buf)) => (half, buf),
        (half, buf) => {
            own.write_half = half;
            own.write_buf = buf;
            return Err(Error::Busy);
        }
    };
    let Some(src_buf) = src.read_buf.as_ref() else {
        own.write_half = Some(half);
        own.write_buf = Some(buf);
        return Err(Error::Busy);
    };
    let count = n.min(src_buf.len());
    let copied = buf.fill(&src_buf.filled()[..count]);
    if !copied {
        own.write_half = Some(half);
        own.write_buf = Some(buf);
        return Err(Error::NoBufferSpace);
    }
    Ok((half, buf))
}

enum IoOutcome {
    Done(std::io::Result<usize>),
    TimedOut,
    Cancelled,
}

/// Race one socket operation against its per-op deadline and the session's
/// cancellation.
async fn run_io<F>(limit: Duration, cancel: &mut watch::Receiver<bool>, op: F) -> IoOutcome
where
    F: Future<Output = std::io::Result<usize>>,
{
    tokio::select! {
        _ = cancelled(cancel) => IoOutcome::Cancelled,
        res = deadline(limit, op) => match res {
            Some(result) => IoOutcome::Done(result),
            None => IoOutcome::TimedOut,
        }
    }
}

/// `timeout` with zero meaning "no deadline".
async fn deadline<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await.ok()
    }
}
