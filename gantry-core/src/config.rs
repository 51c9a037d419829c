//! Construction parameters for pools, servers, and clients.
//!
//! Configuration is plain structs with validated invariants, no file
//! parsing. `Default` gives sensible development values; named presets
//! cover the common deployment shapes; `GANTRY_*` environment variables
//! can override the server tuning knobs for quick experiments.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::Error;

// ============================================================================
// Session pool configuration
// ============================================================================

/// Sizing and timeout parameters for a [`SessionPool`](crate::SessionPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handlers (and their work objects) constructed up front.
    pub preallocated_sessions: usize,
    /// Fixed read buffer capacity per session, in bytes.
    pub read_buffer_size: usize,
    /// Fixed write buffer capacity per session. Zero means "same as read".
    pub write_buffer_size: usize,
    /// Close idle sessions after this long. Zero disables.
    pub session_timeout: Duration,
    /// Per-operation read/write deadline. Zero disables.
    pub io_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            preallocated_sessions: 64,
            read_buffer_size: 8 * 1024,
            write_buffer_size: 0,
            session_timeout: Duration::ZERO,
            io_timeout: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    /// Effective write buffer capacity after the zero-means-read rule.
    pub fn effective_write_buffer_size(&self) -> usize {
        if self.write_buffer_size == 0 {
            self.read_buffer_size
        } else {
            self.write_buffer_size
        }
    }

    /// Check invariants. Called by pool construction.
    pub fn validate(&self) -> Result<(), Error> {
        if self.read_buffer_size == 0 {
            return Err(config_error("read_buffer_size must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Server configuration
// ============================================================================

/// Tuning knobs for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address and port to listen on. Port 0 picks an ephemeral port,
    /// resolvable through `Server::local_addr` once running.
    pub bind_addr: SocketAddr,
    /// Acceptor and I/O loops. One acceptor is bound per I/O loop.
    pub io_pool_size: usize,
    /// Work loops started up front.
    pub work_pool_init_size: usize,
    /// Upper bound the work pool may grow to.
    pub work_pool_high_watermark: usize,
    /// Busy sessions each work loop is expected to carry.
    pub work_pool_thread_load: usize,
    /// Listen backlog passed to the kernel.
    pub backlog: u32,
    /// Set `TCP_NODELAY` on accepted sockets.
    pub nodelay: bool,
    /// Drain callbacks and close sessions cleanly on stop. When false,
    /// outstanding completions may be abandoned.
    pub graceful_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            io_pool_size: 2,
            work_pool_init_size: 2,
            work_pool_high_watermark: 8,
            work_pool_thread_load: 64,
            backlog: 1024,
            nodelay: false,
            graceful_shutdown: true,
        }
    }
}

impl ServerConfig {
    /// Listen on the given address.
    pub fn bind(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Self::default()
        }
    }

    /// Small pools, ephemeral port, graceful stop. For tests and local runs.
    pub fn development() -> Self {
        Self {
            io_pool_size: 1,
            work_pool_init_size: 1,
            work_pool_high_watermark: 2,
            ..Self::default()
        }
    }

    /// Wider pools for many concurrent long-lived connections.
    pub fn high_concurrency() -> Self {
        Self {
            io_pool_size: 4,
            work_pool_init_size: 4,
            work_pool_high_watermark: 32,
            work_pool_thread_load: 128,
            backlog: 4096,
            nodelay: true,
            ..Self::default()
        }
    }

    /// Apply `GANTRY_*` environment overrides on top of this configuration.
    ///
    /// Recognized: `GANTRY_IO_POOL_SIZE`, `GANTRY_WORK_POOL_INIT_SIZE`,
    /// `GANTRY_WORK_POOL_HIGH_WATERMARK`, `GANTRY_WORK_POOL_THREAD_LOAD`,
    /// `GANTRY_BACKLOG`, `GANTRY_NODELAY`. Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_usize("GANTRY_IO_POOL_SIZE") {
            self.io_pool_size = v;
        }
        if let Some(v) = env_usize("GANTRY_WORK_POOL_INIT_SIZE") {
            self.work_pool_init_size = v;
        }
        if let Some(v) = env_usize("GANTRY_WORK_POOL_HIGH_WATERMARK") {
            self.work_pool_high_watermark = v;
        }
        if let Some(v) = env_usize("GANTRY_WORK_POOL_THREAD_LOAD") {
            self.work_pool_thread_load = v;
        }
        if let Some(v) = env_usize("GANTRY_BACKLOG") {
            self.backlog = v as u32;
        }
        if let Some(v) = env_bool("GANTRY_NODELAY") {
            self.nodelay = v;
        }
        self
    }

    /// Check invariants. Called by `Server::run` before binding.
    pub fn validate(&self) -> Result<(), Error> {
        if self.io_pool_size == 0 {
            return Err(config_error("io_pool_size must be at least 1"));
        }
        if self.work_pool_init_size == 0 {
            return Err(config_error("work_pool_init_size must be at least 1"));
        }
        if self.work_pool_high_watermark < self.work_pool_init_size {
            return Err(config_error(
                "work_pool_high_watermark must be >= work_pool_init_size",
            ));
        }
        if self.work_pool_thread_load == 0 {
            return Err(config_error("work_pool_thread_load must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Client configuration
// ============================================================================

/// Tuning knobs for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// I/O loops for outbound sessions.
    pub io_pool_size: usize,
    /// Work loops started up front.
    pub work_pool_init_size: usize,
    /// Upper bound the work pool may grow to.
    pub work_pool_high_watermark: usize,
    /// Busy sessions each work loop is expected to carry.
    pub work_pool_thread_load: usize,
    /// Deadline for establishing an outbound connection. Zero disables.
    pub connect_timeout: Duration,
    /// Set `TCP_NODELAY` on connected sockets.
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            io_pool_size: 2,
            work_pool_init_size: 2,
            work_pool_high_watermark: 8,
            work_pool_thread_load: 64,
            connect_timeout: Duration::from_secs(10),
            nodelay: false,
        }
    }
}

impl ClientConfig {
    /// Check invariants. Called by client construction.
    pub fn validate(&self) -> Result<(), Error> {
        if self.io_pool_size == 0 {
            return Err(config_error("io_pool_size must be at least 1"));
        }
        if self.work_pool_init_size == 0 {
            return Err(config_error("work_pool_init_size must be at least 1"));
        }
        if self.work_pool_high_watermark < self.work_pool_init_size {
            return Err(config_error(
                "work_pool_high_watermark must be >= work_pool_init_size",
            ));
        }
        if self.work_pool_thread_load == 0 {
            return Err(config_error("work_pool_thread_load must be positive"));
        }
        Ok(())
    }
}

fn config_error(msg: &str) -> Error {
    Error::Config(msg.to_string())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.trim() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
