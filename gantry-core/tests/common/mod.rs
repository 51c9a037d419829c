//! Shared fixtures: an echo service, a bidirectional proxy pair, and the
//! counters the scenarios assert against.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_core::{
    allocator_fn, Client, Error, PeerEvent, PlainTransport, PoolConfig, Server, ServerConfig,
    SessionPool, SessionRef, SessionWork, Transport,
};

/// Counters shared between work objects and test assertions.
#[derive(Default)]
pub struct WorkStats {
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub closes: AtomicUsize,
    pub eof_closes: AtomicUsize,
    pub timeout_closes: AtomicUsize,
    pub error_closes: AtomicUsize,
}

impl WorkStats {
    pub fn record_close(&self, err: Option<&Error>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match err {
            None => {}
            Some(Error::Eof) => {
                self.eof_closes.fetch_add(1, Ordering::SeqCst);
            }
            Some(err) if err.is_timeout() => {
                self.timeout_closes.fetch_add(1, Ordering::SeqCst);
            }
            Some(_) => {
                self.error_closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Echo
// ============================================================================

/// Read, echo back, read again.
pub struct EchoWork {
    pub stats: Arc<WorkStats>,
}

impl SessionWork for EchoWork {
    fn on_open(&mut self, session: &SessionRef) {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let _ = session.read_some();
    }

    fn on_read(&mut self, session: &SessionRef, n: usize) {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        let _ = session.write_from(session, n);
    }

    fn on_write(&mut self, session: &SessionRef, _n: usize) {
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        let _ = session.read_some();
    }

    fn on_close(&mut self, _session: &SessionRef, err: Option<&Error>) {
        self.stats.record_close(err);
    }
}

pub fn echo_server(
    config: ServerConfig,
    pool: PoolConfig,
) -> (Arc<Server>, Arc<WorkStats>, Arc<SessionPool>) {
    echo_server_with_transport(config, pool, Arc::new(PlainTransport))
}

pub fn echo_server_with_transport(
    config: ServerConfig,
    pool: PoolConfig,
    transport: Arc<dyn Transport>,
) -> (Arc<Server>, Arc<WorkStats>, Arc<SessionPool>) {
    let stats = Arc::new(WorkStats::default());
    let work_stats = stats.clone();
    let sessions = SessionPool::new(
        pool,
        Arc::new(allocator_fn(move || EchoWork {
            stats: work_stats.clone(),
        })),
    )
    .unwrap();
    let server = Arc::new(Server::new(config, sessions.clone(), transport).unwrap());
    (server, stats, sessions)
}

// ============================================================================
// Proxy pair
// ============================================================================

/// Inbound (parent) half of a proxy: asks the client for a child on open,
/// forwards its reads to the child, writes the child's reads back.
pub struct ProxyParentWork {
    pub client: Arc<Client>,
    pub target: SocketAddr,
    pub stats: Arc<WorkStats>,
}

impl SessionWork for ProxyParentWork {
    fn on_open(&mut self, session: &SessionRef) {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        self.client.connect(session, self.target);
    }

    fn on_read(&mut self, session: &SessionRef, n: usize) {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(child) = session.child() {
            child.post_parent(PeerEvent::ParentWrite(n));
        }
    }

    fn on_write(&mut self, session: &SessionRef, _n: usize) {
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        // The child's bytes are flushed inbound; its buffer is free again.
        if let Some(child) = session.child() {
            let _ = child.read_some();
        }
    }

    fn on_child(&mut self, session: &SessionRef, event: PeerEvent) {
        match event {
            PeerEvent::ChildOpen => {
                let _ = session.read_some();
            }
            PeerEvent::ChildWrite(n) => {
                if let Some(child) = session.child() {
                    let _ = session.write_from(&child, n);
                }
            }
            PeerEvent::ChildClose => session.close(),
            _ => {}
        }
    }

    fn on_close(&mut self, _session: &SessionRef, err: Option<&Error>) {
        self.stats.record_close(err);
    }
}

/// Outbound (child) half: mirror image of the parent.
pub struct ProxyChildWork {
    pub stats: Arc<WorkStats>,
}

impl SessionWork for ProxyChildWork {
    fn on_open(&mut self, session: &SessionRef) {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = session.parent() {
            parent.post_child(PeerEvent::ChildOpen);
        }
        let _ = session.read_some();
    }

    fn on_read(&mut self, session: &SessionRef, n: usize) {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(parent) = session.parent() {
            parent.post_child(PeerEvent::ChildWrite(n));
        }
    }

    fn on_write(&mut self, session: &SessionRef, _n: usize) {
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        // The parent's bytes are flushed to the target; re-arm its read.
        if let Some(parent) = session.parent() {
            let _ = parent.read_some();
        }
    }

    fn on_parent(&mut self, session: &SessionRef, event: PeerEvent) {
        match event {
            PeerEvent::ParentWrite(n) => {
                if let Some(parent) = session.parent() {
                    let _ = session.write_from(&parent, n);
                }
            }
            PeerEvent::ParentClose => session.close(),
            _ => {}
        }
    }

    fn on_close(&mut self, _session: &SessionRef, err: Option<&Error>) {
        self.stats.record_close(err);
    }
}

// ============================================================================
// Harness helpers
// ============================================================================

/// Run the server on a background thread and wait for its bound address.
pub fn start_server(server: &Arc<Server>) -> (std::thread::JoinHandle<Result<(), Error>>, SocketAddr) {
    let runner = server.clone();
    let handle = std::thread::spawn(move || runner.run());
    let addr = wait_for_addr(server);
    (handle, addr)
}

pub fn wait_for_addr(server: &Server) -> SocketAddr {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(addr) = server.local_addr() {
            return addr;
        }
        assert!(Instant::now() < deadline, "server did not bind in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
