#![warn(missing_docs)]

//! wirebound-transport: sockets and threads under the Wirebound RDP.
//!
//! A [`Transport`] owns everything runtime: the UDP socket registry, the
//! I/O readiness loop, the retry sweep, and the callback thread that hands
//! messages to the application. Connections and listeners are `Arc`
//! handles into that machinery:
//!
//! - [`Transport::bind`] opens a listening socket for inbound connections.
//! - [`Transport::open`] dials a peer and blocks until the handshake
//!   completes (or fails, or times out).
//! - [`Connection::send`] is callable from any thread and never blocks;
//!   a full window comes back as [`SendStatus::WindowFull`].
//!
//! Multiple transports coexist in one process; nothing here is global.

mod dispatch;
mod handle;
mod listener;
mod selector;
mod transport;

pub use handle::{Connection, ConnectionId};
pub use listener::Listener;
pub use transport::{OpenOptions, Transport};
pub use wirebound_conn::SendStatus;
