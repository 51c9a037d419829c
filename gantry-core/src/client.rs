//! Outbound counterpart of the server.
//!
//! A [`Client`] produces *child* sessions: outbound connections checked out
//! of the client's own handler pool, paired with the inbound session that
//! requested them. A proxy's server-side work asks the client to connect on
//! `on_open`; once the child is up, the two sides exchange
//! [`PeerEvent`](crate::PeerEvent)s and the framework keeps their shutdown
//! symmetric.
//!
//! The client carries its own I/O and work loop pools, sized independently
//! of any server, and starts them at construction.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::loop_pool::LoopPool;
use crate::peer::PeerEvent;
use crate::session::SessionRef;
use crate::session_pool::SessionPool;
use crate::transport::Transport;
use crate::work_pool::WorkPool;

/// Asynchronously connects child sessions on behalf of parent sessions.
pub struct Client {
    config: ClientConfig,
    sessions: Arc<SessionPool>,
    io_pool: LoopPool,
    work_pool: WorkPool,
    transport: Arc<dyn Transport>,
    stopped: AtomicBool,
}

impl Client {
    /// Build a client around a configured session pool and transport. The
    /// client's loop pools start immediately; connects may be requested as
    /// soon as this returns.
    pub fn new(
        config: ClientConfig,
        sessions: Arc<SessionPool>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let io_pool = LoopPool::new(config.io_pool_size)?;
        let work_pool = WorkPool::new(
            config.work_pool_init_size,
            config.work_pool_high_watermark,
            config.work_pool_thread_load,
        )?;
        sessions.init();
        io_pool.start();
        work_pool.start();
        Ok(Self {
            config,
            sessions,
            io_pool,
            work_pool,
            transport,
            stopped: AtomicBool::new(false),
        })
    }

    /// Begin an async connect to `addr` on behalf of `parent`.
    ///
    /// On success the new child is wired under `parent` (both pairing hooks
    /// fire) and receives `on_open`; on failure the parent receives
    /// `on_child(ChildClose)` and the child handler recycles without ever
    /// opening.
    pub fn connect(&self, parent: &SessionRef, addr: SocketAddr) {
        if self.stopped.load(Ordering::Acquire) {
            parent.post_child(PeerEvent::ChildClose);
            return;
        }
        let child = self
            .sessions
            .get(self.io_pool.get_loop(), self.work_pool.get_loop(self.sessions.load()));
        child.start_outbound(
            addr,
            self.transport.clone(),
            parent.clone(),
            self.config.connect_timeout,
            self.config.nodelay,
        );
    }

    /// Sessions currently checked out of the client's pool.
    pub fn load(&self) -> usize {
        self.sessions.load()
    }

    /// Close all outbound sessions and drain the client's pools. Idempotent;
    /// also runs on drop.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let closing = self.sessions.close_active();
        if closing > 0 {
            info!(sessions = closing, "client closing outbound sessions");
        }
        self.io_pool.stop();
        self.work_pool.stop();
        while !(self.io_pool.is_idle() && self.work_pool.is_idle()) {
            self.work_pool.start();
            self.io_pool.start();
            self.io_pool.stop();
            self.work_pool.stop();
        }
        self.sessions.close();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::transport::PlainTransport;
    use crate::work::{allocator_fn, SessionWork};

    struct NullWork;

    impl SessionWork for NullWork {
        fn on_open(&mut self, _: &SessionRef) {}
        fn on_read(&mut self, _: &SessionRef, _: usize) {}
        fn on_write(&mut self, _: &SessionRef, _: usize) {}
        fn on_close(&mut self, _: &SessionRef, _: Option<&Error>) {}
    }

    #[test]
    fn test_construct_and_stop() {
        let sessions = SessionPool::new(
            PoolConfig {
                preallocated_sessions: 2,
                ..Default::default()
            },
            Arc::new(allocator_fn(|| NullWork)),
        )
        .unwrap();
        let client =
            Client::new(ClientConfig::default(), sessions, Arc::new(PlainTransport)).unwrap();
        assert_eq!(client.load(), 0);
        client.stop();
        client.stop(); // idempotent; drop will no-op too
    }

    #[test]
    fn test_invalid_config_rejected() {
        let sessions = SessionPool::new(
            PoolConfig::default(),
            Arc::new(allocator_fn(|| NullWork)),
        )
        .unwrap();
        let config = ClientConfig {
            io_pool_size: 0,
            ..Default::default()
        };
        assert!(Client::new(config, sessions, Arc::new(PlainTransport)).is_err());
    }
}
