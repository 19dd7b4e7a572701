//! Error types and results.

use std::io;

use thiserror::Error;

/// Reasons a raw datagram fails to decode into a packet.
///
/// A decode failure drops the datagram without touching connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Buffer ends before the header (or an advertised extension) does.
    #[error("datagram truncated")]
    Truncated,
    /// The version-marker bit is not set.
    #[error("missing protocol version marker")]
    MissingVersion,
    /// Flag bits outside the known set, or a nonsensical combination.
    #[error("unrecognized flag combination: {0:#04x}")]
    UnknownFlags(u8),
    /// Data-length field points past the end of the buffer.
    #[error("payload length exceeds datagram")]
    PayloadOverrun,
    /// Payload framing (message/fragment/aggregate envelope) is malformed.
    #[error("malformed payload framing")]
    BadFraming,
}

/// Errors surfaced by the transport and connection layers.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Underlying socket operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// An inbound datagram could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// `send` was called on a connection that is not open.
    #[error("connection is not open")]
    NotOpen,
    /// The active open handshake did not complete.
    #[error("open failed: {0}")]
    OpenFailed(&'static str),
    /// A message exceeds what fragmentation can carry.
    #[error("message of {0} bytes exceeds the maximum fragmentable size")]
    MessageTooLarge(usize),
    /// The requested local port is already registered with this transport.
    #[error("local port {0} is already bound")]
    PortInUse(u16),
    /// The transport has been shut down.
    #[error("transport is closed")]
    Shutdown,
}

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;
