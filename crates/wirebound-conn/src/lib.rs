#![warn(missing_docs)]

//! wirebound-conn: the per-connection RDP state machine.
//!
//! A [`Connection`] is pure protocol state: it consumes decoded packets and
//! clock readings, and returns [`Action`]s (bytes to put on the wire,
//! events to surface) for the transport layer to apply. It performs no I/O
//! and holds no locks, which is what makes the state machine testable by
//! wiring two of them back to back.

mod connection;
mod event;
mod reassembly;
mod shaper;
mod state;

pub use connection::{Connection, SendStatus};
pub use event::{Action, ConnEvent};
pub use reassembly::Reassembly;
pub use state::ConnectionState;
