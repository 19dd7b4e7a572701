//! Actions and events a connection hands back to its transport.

/// Events a connection surfaces to the application layer.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnEvent {
    /// The handshake completed; the connection is open. Emitted exactly
    /// once, on either side.
    Opened,
    /// A complete application message is ready for delivery.
    Message(Vec<u8>),
    /// The connection was reset, locally or by the peer. Emitted exactly
    /// once no matter how many RSTs arrive.
    Reset,
}

/// Instructions a connection returns to the transport that drives it.
///
/// The state machine never touches a socket; it asks the dispatcher to.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes to the shared UDP socket, addressed to the peer.
    Send(Vec<u8>),
    /// Surface this event to the application.
    Emit(ConnEvent),
}
