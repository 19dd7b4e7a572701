#![warn(missing_docs)]

//! wirebound-protocol: the wire layer of the Wirebound RDP.
//!
//! This crate knows how bytes look on the network and nothing else:
//! - `packet`: packet flags and the in-memory packet representation
//! - `codec`: header + packet encode/decode
//! - `payload`: payload framing (single message, fragment, aggregate)
//! - `seq`: serial arithmetic over 32-bit sequence numbers
//!
//! Sequence/window validation is deliberately absent here; that is
//! connection-state business and lives in `wirebound-conn`.

pub mod codec;
pub mod packet;
pub mod payload;
pub mod seq;
