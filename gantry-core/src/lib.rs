// Core library for the Gantry TCP service framework
// This crate contains the loop tiers, session machinery, and pools; the
// application supplies work objects and (optionally) a transport.

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod loop_pool;
pub mod peer;
pub mod server;
pub mod session;
pub mod session_pool;
pub mod transport;
pub mod work;
pub mod work_pool;

// Re-export commonly used types
pub use buffer::SessionBuffer;
pub use client::Client;
pub use config::{ClientConfig, PoolConfig, ServerConfig};
pub use error::Error;
pub use event_loop::EventLoop;
pub use loop_pool::LoopPool;
pub use peer::PeerEvent;
pub use server::{Server, ServerStats};
pub use session::{SessionHandler, SessionRef, SessionState};
pub use session_pool::SessionPool;
pub use transport::{BoxedStream, PlainTransport, SessionStream, Transport};
pub use work::{allocator_fn, FnAllocator, SessionWork, WorkAllocator};
pub use work_pool::WorkPool;
