//! Datagram filter hook for inspection, mutation, and loss injection.

use std::net::SocketAddr;

/// Observes and optionally vetoes every datagram crossing a transport.
///
/// Both hooks run on the transport's own threads (I/O thread for receive,
/// whichever thread flushes for send), so implementations must be cheap and
/// must not block. Returning `false` drops the datagram.
///
/// The scenario tests use this to inject deterministic packet loss.
pub trait PacketFilter: Send {
    /// Called for every inbound datagram before decoding. May mutate the
    /// bytes in place. Return `false` to drop.
    fn on_receive(&mut self, addr: &SocketAddr, data: &mut [u8]) -> bool;

    /// Called for every outbound datagram before the socket write. May
    /// mutate the bytes. Return `false` to drop.
    fn on_send(&mut self, addr: &SocketAddr, data: &mut Vec<u8>) -> bool;
}

/// Filter that passes every datagram through untouched.
#[derive(Debug, Default)]
pub struct NoOpFilter;

impl PacketFilter for NoOpFilter {
    fn on_receive(&mut self, _addr: &SocketAddr, _data: &mut [u8]) -> bool {
        true
    }

    fn on_send(&mut self, _addr: &SocketAddr, _data: &mut Vec<u8>) -> bool {
        true
    }
}
