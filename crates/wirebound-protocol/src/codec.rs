//! Packet encoding and decoding.
//!
//! The header is self-describing: the second byte holds the number of
//! 4-byte extended-ack entries that follow the fixed fields, so a decoder
//! never has to infer lengths from the flag byte alone.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use wirebound_core::{
    constants::{EACK_ENTRY_SIZE, FIXED_HEADER_SIZE, MAX_DATA_LEN, SYN_HEADER_SIZE},
    error::DecodeError,
};

use crate::packet::{Flags, Packet, SynParams};

/// High bit of the SYN options field: ordered delivery required.
const OPT_SEQUENCED: u16 = 0x8000;

/// Encodes a packet into a fresh byte vector.
///
/// Panics in debug builds if the payload exceeds the 16-bit data-length
/// field or the eack list exceeds one byte of count; both are bounded far
/// below those limits by the connection layer.
pub fn encode(packet: &Packet) -> Vec<u8> {
    debug_assert!(packet.payload.len() <= MAX_DATA_LEN);
    debug_assert!(packet.eacks.len() <= u8::MAX as usize);
    debug_assert_eq!(packet.flags.is_syn(), packet.syn.is_some());
    debug_assert_eq!(packet.flags.is_eack(), !packet.eacks.is_empty());

    let mut buffer = Vec::with_capacity(
        FIXED_HEADER_SIZE
            + if packet.syn.is_some() { SYN_HEADER_SIZE } else { 0 }
            + packet.eacks.len() * EACK_ENTRY_SIZE
            + packet.payload.len(),
    );

    // Infallible writes: Vec<u8> never errors.
    buffer.write_u8(packet.flags.raw()).unwrap();
    buffer.write_u8(packet.eacks.len() as u8).unwrap();
    buffer.write_u16::<BigEndian>(packet.payload.len() as u16).unwrap();
    buffer.write_u32::<BigEndian>(packet.seq).unwrap();
    buffer.write_u32::<BigEndian>(packet.ack).unwrap();

    if let Some(params) = packet.syn {
        buffer.write_u16::<BigEndian>(params.window).unwrap();
        buffer.write_u16::<BigEndian>(params.max_segment).unwrap();
        let options = if params.sequenced { OPT_SEQUENCED } else { 0 };
        buffer.write_u16::<BigEndian>(options).unwrap();
    }

    for eack in &packet.eacks {
        buffer.write_u32::<BigEndian>(*eack).unwrap();
    }

    buffer.extend_from_slice(&packet.payload);
    buffer
}

/// Decodes a raw datagram into a packet.
///
/// Fails on truncation, a missing version marker, or an unrecognized flag
/// combination. No sequence or window validation happens here.
pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
    let mut cursor = Cursor::new(data);

    let raw_flags = cursor.read_u8().map_err(|_| DecodeError::Truncated)?;
    let flags = Flags::from_wire(raw_flags)?;
    let eack_count = cursor.read_u8().map_err(|_| DecodeError::Truncated)? as usize;
    let data_len = cursor.read_u16::<BigEndian>().map_err(|_| DecodeError::Truncated)? as usize;
    let seq = cursor.read_u32::<BigEndian>().map_err(|_| DecodeError::Truncated)?;
    let ack = cursor.read_u32::<BigEndian>().map_err(|_| DecodeError::Truncated)?;

    let syn = if flags.is_syn() {
        let window = cursor.read_u16::<BigEndian>().map_err(|_| DecodeError::Truncated)?;
        let max_segment = cursor.read_u16::<BigEndian>().map_err(|_| DecodeError::Truncated)?;
        let options = cursor.read_u16::<BigEndian>().map_err(|_| DecodeError::Truncated)?;
        Some(SynParams { window, max_segment, sequenced: options & OPT_SEQUENCED != 0 })
    } else {
        None
    };

    // The count byte and the flag must agree; a packet claiming entries
    // without the flag (or vice versa) did not come from this codec.
    if (eack_count > 0) != flags.is_eack() {
        return Err(DecodeError::UnknownFlags(raw_flags));
    }

    let mut eacks = Vec::with_capacity(eack_count);
    for _ in 0..eack_count {
        eacks.push(cursor.read_u32::<BigEndian>().map_err(|_| DecodeError::Truncated)?);
    }

    let mut payload = vec![0u8; data_len];
    cursor.read_exact(&mut payload).map_err(|_| DecodeError::PayloadOverrun)?;

    Ok(Packet { flags, seq, ack, syn, eacks, payload })
}
