#![warn(missing_docs)]

//! wirebound-core: foundational types shared across all layers.
//!
//! This crate provides the minimal set of core utilities the rest of the
//! workspace builds on:
//! - Configuration types
//! - Error handling
//! - Protocol constants
//! - Datagram filter hook for inspection, mutation, and loss injection
//!
//! Protocol and connection logic lives in the specialized crates:
//! - `wirebound-protocol`: wire packet codec, payload framing, sequence math
//! - `wirebound-conn`: per-connection state machine
//! - `wirebound-transport`: socket registry, dispatcher threads, listener

/// Protocol constants shared across layers.
pub mod constants {
    /// Size of the fixed packet header: flags, eack count, data length,
    /// sequence number, ack number.
    pub const FIXED_HEADER_SIZE: usize = 12;
    /// Additional header bytes present on SYN packets (window, max segment,
    /// options).
    pub const SYN_HEADER_SIZE: usize = 6;
    /// Size of one extended-ack entry in the header.
    pub const EACK_ENTRY_SIZE: usize = 4;
    /// Largest payload expressible by the 16-bit data-length field.
    pub const MAX_DATA_LEN: usize = u16::MAX as usize;
    /// Default maximum payload carried by a single packet.
    ///
    /// Chosen to keep the whole datagram under a conservative path MTU:
    ///       1300 + 12 header + 28 IPv4/UDP < 1400
    pub const DEFAULT_SEGMENT_SIZE: u16 = 1300;
    /// Default outstanding-packet window advertised at handshake.
    pub const DEFAULT_WINDOW: u16 = 64;
    /// Default maximal number of fragments per message.
    pub const MAX_FRAGMENTS_DEFAULT: u8 = 64;
}

pub mod config;
pub mod error;
pub mod filter;
