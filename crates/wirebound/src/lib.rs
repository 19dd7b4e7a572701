#![warn(missing_docs)]

//! Wirebound: a small public API facade for the workspace.
//!
//! This crate re-exports the surface needed to run reliable datagram
//! connections over UDP:
//!
//! - Transport, connections, and listeners (`Transport`, `Connection`,
//!   `Listener`, `OpenOptions`)
//! - Send outcomes and connection state (`SendStatus`, `ConnectionState`)
//! - Core configuration and errors (`Config`, `ErrorKind`)
//!
//! Example
//! ```no_run
//! use std::time::Duration;
//! use wirebound::{Config, OpenOptions, Transport};
//!
//! let server = Transport::new(Config::default()).unwrap();
//! let listener = server.bind(Some(7777)).unwrap();
//! listener.on_accept(|conn| {
//!     conn.on_message(|payload| println!("got {} bytes", payload.len()));
//! });
//!
//! let client = Transport::new(Config::default()).unwrap();
//! let conn = client
//!     .open(("127.0.0.1", 7777), OpenOptions {
//!         sequenced: true,
//!         timeout: Some(Duration::from_secs(5)),
//!         ..Default::default()
//!     })
//!     .unwrap();
//! conn.send(b"hello").unwrap();
//! ```

// Core config and errors
pub use wirebound_core::{
    config::Config,
    error::{DecodeError, ErrorKind, Result},
    filter::{NoOpFilter, PacketFilter},
};
// Connection state machine surface
pub use wirebound_conn::{ConnectionState, SendStatus};
// Transport: sockets, threads, handles
pub use wirebound_transport::{Connection, ConnectionId, Listener, OpenOptions, Transport};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, Connection, ConnectionState, ErrorKind, Listener, OpenOptions, SendStatus,
        Transport,
    };
}
