//! The acceptor orchestrator.
//!
//! A [`Server`] owns the three loop tiers and a session pool, binds one
//! listening socket per acceptor loop, and runs accept-and-dispatch until
//! stopped:
//!
//! - **Acceptor loops** do nothing but accept. Each acceptor owns its own
//!   listener bound to the shared endpoint (`SO_REUSEADDR`, plus
//!   `SO_REUSEPORT` on unix so the kernel spreads connections across
//!   acceptor threads; elsewhere a single acceptor is used).
//! - **I/O loops** carry socket reads and writes, round-robin per session.
//! - **Work loops** carry application callbacks and grow with load.
//!
//! Every accept checks a handler out of the pool *first*, bound to the next
//! I/O loop and a load-picked work loop, so a connection storm degrades into
//! pool growth rather than allocation churn on the accept path.
//!
//! # Lifecycle
//!
//! [`run`](Server::run) blocks the calling thread until [`stop`](Server::stop)
//! is called from anywhere (typically a signal handler's thread). The
//! default stop is graceful: accepting ends, live sessions are closed
//! cleanly, and the I/O and work pools are cycled until neither holds a
//! queued callback; callbacks in flight at stop time may post follow-ups
//! into the other pool, so the drain repeats until both report idle. A
//! non-graceful stop cancels both pools instead and may abandon in-flight
//! completions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::event_loop::cancelled;
use crate::loop_pool::LoopPool;
use crate::session_pool::SessionPool;
use crate::transport::Transport;
use crate::work_pool::WorkPool;

/// A TCP server built from three loop tiers and a handler pool.
pub struct Server {
    config: ServerConfig,
    sessions: Arc<SessionPool>,
    acceptor_pool: LoopPool,
    io_pool: LoopPool,
    work_pool: WorkPool,
    transport: Arc<dyn Transport>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    bound_addr: Mutex<Option<SocketAddr>>,
    accepted: Arc<AtomicU64>,
}

/// Liveness snapshot of a running server.
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Connections accepted since construction.
    pub accepted: u64,
    /// Sessions currently checked out of the pool.
    pub active_sessions: usize,
    /// Fixed I/O loop count.
    pub io_loops: usize,
    /// Current (elastic) work loop count.
    pub work_loops: usize,
}

impl Server {
    /// Build a server around a configured session pool and transport.
    /// Validates the configuration, constructs the loop tiers, and
    /// preallocates the pool. Fatal errors only; nothing is bound yet.
    pub fn new(
        config: ServerConfig,
        sessions: Arc<SessionPool>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let acceptor_pool = LoopPool::new(config.io_pool_size)?;
        let io_pool = LoopPool::new(config.io_pool_size)?;
        let work_pool = WorkPool::new(
            config.work_pool_init_size,
            config.work_pool_high_watermark,
            config.work_pool_thread_load,
        )?;
        sessions.init();
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            sessions,
            acceptor_pool,
            io_pool,
            work_pool,
            transport,
            shutdown,
            running: AtomicBool::new(false),
            bound_addr: Mutex::new(None),
            accepted: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The resolved listening address, once `run` has bound its sockets.
    /// Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    /// Liveness counters.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            active_sessions: self.sessions.load(),
            io_loops: self.io_pool.len(),
            work_loops: self.work_pool.current_size(),
        }
    }

    /// Bind, accept, and dispatch until stopped. Blocks the calling thread.
    /// Returns early with [`Error::Bind`] when the endpoint cannot be bound.
    pub fn run(&self) -> Result<(), Error> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.run_inner();
        if result.is_err() {
            *self.bound_addr.lock() = None;
        }
        self.running.store(false, Ordering::Release);
        result
    }

    fn run_inner(&self) -> Result<(), Error> {
        self.shutdown.send_replace(false);
        let listeners = self.bind_listeners()?;
        info!(
            addr = %self.local_addr().unwrap_or(self.config.bind_addr),
            acceptors = listeners.len(),
            io_loops = self.io_pool.len(),
            work_loops = self.work_pool.current_size(),
            "server listening"
        );
        self.spawn_acceptors(listeners);

        // Work first, then I/O, then accept: by the time a connection can
        // arrive, everything downstream of it is already running.
        self.work_pool.start();
        self.io_pool.start();
        if !*self.shutdown.borrow() {
            self.acceptor_pool.run();
        }

        if self.config.graceful_shutdown {
            let closing = self.sessions.close_active();
            if closing > 0 {
                debug!(sessions = closing, "closing live sessions");
            }
            self.io_pool.stop();
            self.work_pool.stop();
            // Callbacks in flight at stop time may have posted follow-up
            // tasks into the other pool after it drained. Cycle both pools
            // until neither holds work; the chains are finite because the
            // sockets are gone.
            while !(self.io_pool.is_idle() && self.work_pool.is_idle()) {
                self.work_pool.start();
                self.io_pool.start();
                self.io_pool.stop();
                self.work_pool.stop();
            }
        } else {
            self.io_pool.force_stop();
            self.work_pool.force_stop();
        }
        *self.bound_addr.lock() = None;
        info!("server stopped");
        Ok(())
    }

    /// Request shutdown. Safe from any thread; returns immediately while
    /// `run` unwinds. No-op when the server is not running.
    pub fn stop(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        info!("server stop requested");
        self.shutdown.send_replace(true);
        self.acceptor_pool.request_stop();
    }

    fn bind_listeners(&self) -> Result<Vec<TcpListener>, Error> {
        // Parallel acceptors need SO_REUSEPORT; where it does not exist a
        // single acceptor serves all I/O loops.
        let count = if cfg!(unix) {
            self.config.io_pool_size
        } else {
            1
        };
        let mut listeners = Vec::with_capacity(count);
        let mut addr = self.config.bind_addr;
        for i in 0..count {
            let event_loop = self.acceptor_pool.loop_at(i);
            let listener = {
                // Listeners register with the reactor of the loop that will
                // drive their accepts.
                let _guard = event_loop.enter();
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(Error::Bind)?;
                socket.set_reuseaddr(true).map_err(Error::Bind)?;
                #[cfg(unix)]
                if count > 1 {
                    socket.set_reuseport(true).map_err(Error::Bind)?;
                }
                socket.bind(addr).map_err(Error::Bind)?;
                socket.listen(self.config.backlog).map_err(Error::Bind)?
            };
            if i == 0 {
                // Resolve port 0 so the remaining acceptors share the port.
                addr = listener.local_addr().map_err(Error::Bind)?;
                *self.bound_addr.lock() = Some(addr);
            }
            listeners.push(listener);
        }
        Ok(listeners)
    }

    fn spawn_acceptors(&self, listeners: Vec<TcpListener>) {
        for (i, listener) in listeners.into_iter().enumerate() {
            let event_loop = self.acceptor_pool.loop_at(i);
            let sessions = self.sessions.clone();
            let io_pool = self.io_pool.clone();
            let work_pool = self.work_pool.clone();
            let transport = self.transport.clone();
            let nodelay = self.config.nodelay;
            let accepted = self.accepted.clone();
            let mut shutdown = self.shutdown.subscribe();

            event_loop.submit(async move {
                loop {
                    // Checkout before accept: the handler is already bound
                    // to its loops when the connection lands.
                    let session =
                        sessions.get(io_pool.get_loop(), work_pool.get_loop(sessions.load()));
                    tokio::select! {
                        _ = cancelled(&mut shutdown) => {
                            session.abort_unopened();
                            break;
                        }
                        res = listener.accept() => match res {
                            Ok((stream, _peer)) => {
                                accepted.fetch_add(1, Ordering::Relaxed);
                                match stream.into_std() {
                                    Ok(std_stream) => {
                                        session.start_inbound(std_stream, transport.clone(), nodelay);
                                    }
                                    Err(err) => {
                                        debug!(error = %err, "could not detach accepted stream");
                                        session.abort_unopened();
                                    }
                                }
                            }
                            Err(err) => {
                                // Transient: recycle the handler, re-arm.
                                debug!(error = %Error::Accept(err), "accept re-armed");
                                session.abort_unopened();
                            }
                        }
                    }
                }
                // The listener closes here, on its own loop.
            });
        }
    }
}
