//! Packet flags and the in-memory packet representation.

use wirebound_core::error::DecodeError;

use crate::seq::SequenceNumber;

/// Flag byte of the packet header.
///
/// Bit layout: bit7 SYN, bit6 ACK, bit5 EACK, bit4 RST, bit3 NUL,
/// bit1 version marker. The version marker is set on every valid packet;
/// its absence marks foreign traffic.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    /// Handshake-open flag.
    pub const SYN: u8 = 0b1000_0000;
    /// Acknowledgment flag: the ack-number field is meaningful.
    pub const ACK: u8 = 0b0100_0000;
    /// Extended-acknowledgment flag: eack entries follow the header.
    pub const EACK: u8 = 0b0010_0000;
    /// Reset/close flag.
    pub const RST: u8 = 0b0001_0000;
    /// Keepalive flag.
    pub const NUL: u8 = 0b0000_1000;
    /// Protocol version marker, set on every packet.
    pub const VERSION: u8 = 0b0000_0010;

    const KNOWN: u8 = Self::SYN | Self::ACK | Self::EACK | Self::RST | Self::NUL | Self::VERSION;

    /// Builds a flag byte from the given bits; the version marker is
    /// always included.
    pub fn new(bits: u8) -> Self {
        Flags(bits | Self::VERSION)
    }

    /// Validates a raw wire byte into flags.
    ///
    /// Rejects unknown bits, a missing version marker, and combinations
    /// no sender produces (SYN with RST or NUL, RST with NUL).
    pub fn from_wire(raw: u8) -> Result<Self, DecodeError> {
        if raw & !Self::KNOWN != 0 {
            return Err(DecodeError::UnknownFlags(raw));
        }
        if raw & Self::VERSION == 0 {
            return Err(DecodeError::MissingVersion);
        }
        let syn = raw & Self::SYN != 0;
        let rst = raw & Self::RST != 0;
        let nul = raw & Self::NUL != 0;
        if (syn && (rst || nul)) || (rst && nul) {
            return Err(DecodeError::UnknownFlags(raw));
        }
        Ok(Flags(raw))
    }

    /// Raw byte as written to the wire.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// True if the SYN bit is set.
    pub fn is_syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    /// True if the ACK bit is set.
    pub fn is_ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// True if the EACK bit is set.
    pub fn is_eack(self) -> bool {
        self.0 & Self::EACK != 0
    }

    /// True if the RST bit is set.
    pub fn is_rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    /// True if the NUL bit is set.
    pub fn is_nul(self) -> bool {
        self.0 & Self::NUL != 0
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.is_syn() {
            names.push("SYN");
        }
        if self.is_ack() {
            names.push("ACK");
        }
        if self.is_eack() {
            names.push("EACK");
        }
        if self.is_rst() {
            names.push("RST");
        }
        if self.is_nul() {
            names.push("NUL");
        }
        write!(f, "Flags({})", names.join("|"))
    }
}

/// Handshake parameters carried only on SYN packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynParams {
    /// Outstanding-packet window the sender is prepared to receive.
    pub window: u16,
    /// Largest single-packet payload the sender accepts.
    pub max_segment: u16,
    /// Whether the sender requires ordered delivery on this connection.
    pub sequenced: bool,
}

/// A decoded (or to-be-encoded) protocol packet.
///
/// Transmit timestamps are tracked by the connection's unacked queue, not
/// here; a `Packet` is purely what crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Flag set for this packet.
    pub flags: Flags,
    /// Sequence number. Consumed by SYN/NUL/data packets; pure ACKs carry
    /// the next unconsumed sequence.
    pub seq: SequenceNumber,
    /// Acknowledgment number: highest in-order sequence received.
    pub ack: SequenceNumber,
    /// Present exactly when the SYN flag is set.
    pub syn: Option<SynParams>,
    /// Out-of-order sequences already received, advertised so the peer
    /// need not retransmit them. Non-empty exactly when EACK is set.
    pub eacks: Vec<SequenceNumber>,
    /// Framed payload bytes (see `payload`); empty on SYN/ACK/RST/NUL.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Active-open SYN.
    pub fn syn(seq: SequenceNumber, params: SynParams) -> Self {
        Packet {
            flags: Flags::new(Flags::SYN),
            seq,
            ack: 0,
            syn: Some(params),
            eacks: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Passive-open reply: SYN acknowledging the initiator's SYN.
    pub fn syn_ack(seq: SequenceNumber, ack: SequenceNumber, params: SynParams) -> Self {
        Packet {
            flags: Flags::new(Flags::SYN | Flags::ACK),
            seq,
            ack,
            syn: Some(params),
            eacks: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Pure acknowledgment, optionally carrying extended acks.
    pub fn ack(seq: SequenceNumber, ack: SequenceNumber, eacks: Vec<SequenceNumber>) -> Self {
        let bits = if eacks.is_empty() { Flags::ACK } else { Flags::ACK | Flags::EACK };
        Packet { flags: Flags::new(bits), seq, ack, syn: None, eacks, payload: Vec::new() }
    }

    /// Data packet with a piggybacked ack.
    pub fn data(
        seq: SequenceNumber,
        ack: SequenceNumber,
        eacks: Vec<SequenceNumber>,
        payload: Vec<u8>,
    ) -> Self {
        let bits = if eacks.is_empty() { Flags::ACK } else { Flags::ACK | Flags::EACK };
        Packet { flags: Flags::new(bits), seq, ack, syn: None, eacks, payload }
    }

    /// NUL keepalive. Consumes a sequence number like data does.
    pub fn nul(seq: SequenceNumber, ack: SequenceNumber) -> Self {
        Packet {
            flags: Flags::new(Flags::NUL | Flags::ACK),
            seq,
            ack,
            syn: None,
            eacks: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Reset packet.
    pub fn rst(seq: SequenceNumber, ack: SequenceNumber) -> Self {
        Packet {
            flags: Flags::new(Flags::RST | Flags::ACK),
            seq,
            ack,
            syn: None,
            eacks: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// True if this packet consumes a send sequence number: SYN, NUL, and
    /// data packets do; pure ACK/RST packets do not.
    pub fn consumes_sequence(&self) -> bool {
        self.flags.is_syn() || self.flags.is_nul() || !self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_marker_is_always_set() {
        assert_ne!(Flags::new(Flags::ACK).raw() & Flags::VERSION, 0);
        assert_ne!(Packet::rst(1, 2).flags.raw() & Flags::VERSION, 0);
    }

    #[test]
    fn from_wire_rejects_unknown_bits() {
        assert_eq!(Flags::from_wire(0b0000_0101), Err(DecodeError::UnknownFlags(0b0000_0101)));
    }

    #[test]
    fn from_wire_rejects_missing_version() {
        assert_eq!(Flags::from_wire(Flags::ACK), Err(DecodeError::MissingVersion));
    }

    #[test]
    fn from_wire_rejects_contradictory_combinations() {
        for raw in [
            Flags::SYN | Flags::RST | Flags::VERSION,
            Flags::SYN | Flags::NUL | Flags::VERSION,
            Flags::RST | Flags::NUL | Flags::VERSION,
        ] {
            assert_eq!(Flags::from_wire(raw), Err(DecodeError::UnknownFlags(raw)));
        }
    }

    #[test]
    fn sequence_consumption() {
        let params = SynParams { window: 8, max_segment: 1300, sequenced: false };
        assert!(Packet::syn(0, params).consumes_sequence());
        assert!(Packet::nul(1, 0).consumes_sequence());
        assert!(Packet::data(2, 0, vec![], vec![0]).consumes_sequence());
        assert!(!Packet::ack(3, 0, vec![]).consumes_sequence());
        assert!(!Packet::rst(3, 0).consumes_sequence());
    }
}
