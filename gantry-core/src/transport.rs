//! Stream typing hook.
//!
//! The framework carries opaque bytes over whatever stream the transport
//! produces. [`PlainTransport`] hands back the TCP stream unchanged; a TLS
//! transport would run its handshake here and return the wrapped stream.
//! The handshake itself is the transport's business; sessions only see the
//! finished duplex stream.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Object-safe alias for the byte streams sessions operate on.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

/// A boxed duplex stream, as produced by a [`Transport`].
pub type BoxedStream = Box<dyn SessionStream>;

/// Converts freshly accepted or connected TCP streams into the streams
/// sessions read and write.
///
/// Both hooks run on the session's I/O loop, before `on_open` is delivered,
/// and are subject to the session's cancellation: closing the server while a
/// handshake is in flight abandons it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Server side: wrap an accepted stream.
    async fn accept(&self, stream: TcpStream) -> std::io::Result<BoxedStream>;

    /// Client side: wrap an outbound stream after connect.
    async fn connect(&self, stream: TcpStream) -> std::io::Result<BoxedStream>;
}

/// Plain TCP: streams pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTransport;

#[async_trait]
impl Transport for PlainTransport {
    async fn accept(&self, stream: TcpStream) -> std::io::Result<BoxedStream> {
        Ok(Box::new(stream))
    }

    async fn connect(&self, stream: TcpStream) -> std::io::Result<BoxedStream> {
        Ok(Box::new(stream))
    }
}
