// Gantry - an asynchronous TCP service framework for Rust
//
// This library provides tiered reactor pools (accept / I/O / work), a
// recyclable per-connection handler pool, and a paired-session protocol for
// proxy-style services, over pluggable stream transports.

// Re-export core functionality
pub use gantry_core::*;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        allocator_fn,
        Client,
        ClientConfig,
        Error,
        PeerEvent,
        PlainTransport,
        PoolConfig,
        Server,
        ServerConfig,
        SessionPool,
        SessionRef,
        SessionWork,
        Transport,
        WorkAllocator,
    };
}
