//! Event vocabulary for paired sessions.
//!
//! When an inbound session (the parent) drives an outbound session (the
//! child), as in a proxy, a TLS offload hop, or a chained service, the two sides
//! exchange a small closed set of events through the framework instead of
//! sharing state. Each event is delivered on the receiving session's work
//! loop, so handling is serialized with the receiver's other callbacks.

/// An event exchanged between a parent session and its child.
///
/// Byte counts refer to the *sender's* read buffer: `ParentWrite(n)` asks
/// the child to write the first `n` bytes of the parent's read buffer to its
/// own socket, and symmetrically for `ChildWrite(n)`. Because the sender
/// does not re-arm its read until the receiver's write completes, each
/// direction gets natural backpressure without a flow-control window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Parent asks the child to forward `n` bytes from the parent's read buffer.
    ParentWrite(usize),
    /// Parent has closed; the child should finish pending writes and close.
    ParentClose,
    /// The outbound connection is established; the parent may start reading.
    ChildOpen,
    /// Child asks the parent to forward `n` bytes from the child's read buffer.
    ChildWrite(usize),
    /// Child has closed; the parent should close.
    ChildClose,
}

impl PeerEvent {
    /// True for the two close notifications.
    pub fn is_close(&self) -> bool {
        matches!(self, PeerEvent::ParentClose | PeerEvent::ChildClose)
    }
}
