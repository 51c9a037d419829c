// Error types for the Gantry framework

use thiserror::Error;

/// Errors surfaced by the framework, either as return values of fallible
/// operations or as the reason passed to a session's `on_close` callback.
///
/// Per-connection errors are transient: they end the session that hit them
/// and never the server. Only [`Error::Bind`] and pool construction failures
/// are fatal, and those are returned from `Server::run` directly.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind listening socket: {0}")]
    Bind(std::io::Error),

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("peer closed the connection")]
    Eof,

    #[error("connection reset by peer")]
    Reset,

    #[error("connection aborted")]
    Aborted,

    #[error("connection refused")]
    Refused,

    #[error("operation timed out")]
    TimedOut,

    #[error("payload exceeds the session write buffer")]
    NoBufferSpace,

    #[error("operation already in flight")]
    Busy,

    #[error("session is no longer open")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify an I/O error from a socket operation into a session error.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset => Error::Reset,
            ErrorKind::ConnectionAborted => Error::Aborted,
            ErrorKind::ConnectionRefused => Error::Refused,
            ErrorKind::UnexpectedEof => Error::Eof,
            ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::Io(err),
        }
    }

    /// True for the ordinary ways a peer ends a connection. These are part
    /// of normal operation and are surfaced to `on_close` without logging.
    pub fn is_peer_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Eof | Error::Reset | Error::Aborted | Error::Refused
        )
    }

    /// True when a session or per-operation timer expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// Whether the close path should log this error. Peer disconnects,
    /// timeouts, and cancellations are routine; everything else is worth a
    /// warning.
    pub fn should_log(&self) -> bool {
        !self.is_peer_disconnect() && !self.is_timeout() && !matches!(self, Error::Cancelled)
    }
}
