//! Payload framing.
//!
//! Every data packet's payload opens with a one-byte kind tag:
//! - `MSG`: a single application message, bytes follow directly.
//! - `FRAG`: one fragment of an oversized message — group id, zero-based
//!   index, and (on index 0 only) the total fragment count.
//! - `AGG`: several small messages packed together — a count, then
//!   length-prefixed entries in their original send order.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use wirebound_core::error::DecodeError;

const KIND_MSG: u8 = 0;
const KIND_FRAG: u8 = 1;
const KIND_AGG: u8 = 2;

/// Bytes the `MSG` envelope adds to a payload.
pub const MSG_OVERHEAD: usize = 1;
/// Bytes the `AGG` envelope adds before the first entry (kind + count).
pub const AGG_BASE_OVERHEAD: usize = 2;
/// Bytes each aggregated entry adds (length prefix).
pub const AGG_ENTRY_OVERHEAD: usize = 2;

/// Bytes the `FRAG` envelope adds: kind, group, index, plus the total
/// count on the first fragment.
pub fn fragment_overhead(first: bool) -> usize {
    if first {
        5
    } else {
        4
    }
}

/// A decoded packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// One application message.
    Message(Vec<u8>),
    /// One fragment of a larger message.
    Fragment {
        /// Reassembly group this fragment belongs to.
        group: u16,
        /// Zero-based position within the group.
        index: u8,
        /// Total fragments in the group; present only on index 0.
        count: Option<u8>,
        /// Fragment bytes.
        bytes: Vec<u8>,
    },
    /// Several small messages packed into one payload.
    Aggregate(Vec<Vec<u8>>),
}

/// Frames a single application message.
pub fn encode_message(bytes: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(MSG_OVERHEAD + bytes.len());
    buffer.push(KIND_MSG);
    buffer.extend_from_slice(bytes);
    buffer
}

/// Frames one fragment. `count` must be `Some` exactly when `index == 0`.
pub fn encode_fragment(group: u16, index: u8, count: Option<u8>, bytes: &[u8]) -> Vec<u8> {
    debug_assert_eq!(index == 0, count.is_some());
    let mut buffer = Vec::with_capacity(fragment_overhead(index == 0) + bytes.len());
    buffer.push(KIND_FRAG);
    buffer.write_u16::<BigEndian>(group).unwrap();
    buffer.push(index);
    if let Some(count) = count {
        buffer.push(count);
    }
    buffer.extend_from_slice(bytes);
    buffer
}

/// Packs several messages into one aggregate payload, in order.
///
/// Callers keep entries small enough that count and lengths fit their
/// fields; the shaper never aggregates past those bounds.
pub fn encode_aggregate(messages: &[Vec<u8>]) -> Vec<u8> {
    debug_assert!(messages.len() <= u8::MAX as usize);
    let total: usize = messages.iter().map(|m| AGG_ENTRY_OVERHEAD + m.len()).sum();
    let mut buffer = Vec::with_capacity(AGG_BASE_OVERHEAD + total);
    buffer.push(KIND_AGG);
    buffer.push(messages.len() as u8);
    for message in messages {
        debug_assert!(message.len() <= u16::MAX as usize);
        buffer.write_u16::<BigEndian>(message.len() as u16).unwrap();
        buffer.extend_from_slice(message);
    }
    buffer
}

/// Decodes a framed payload.
pub fn decode(data: &[u8]) -> Result<Payload, DecodeError> {
    let mut cursor = Cursor::new(data);
    let kind = cursor.read_u8().map_err(|_| DecodeError::BadFraming)?;
    match kind {
        KIND_MSG => Ok(Payload::Message(data[1..].to_vec())),
        KIND_FRAG => {
            let group = cursor.read_u16::<BigEndian>().map_err(|_| DecodeError::BadFraming)?;
            let index = cursor.read_u8().map_err(|_| DecodeError::BadFraming)?;
            let count = if index == 0 {
                let count = cursor.read_u8().map_err(|_| DecodeError::BadFraming)?;
                if count == 0 {
                    return Err(DecodeError::BadFraming);
                }
                Some(count)
            } else {
                None
            };
            let mut bytes = Vec::new();
            cursor.read_to_end(&mut bytes).map_err(|_| DecodeError::BadFraming)?;
            Ok(Payload::Fragment { group, index, count, bytes })
        }
        KIND_AGG => {
            let count = cursor.read_u8().map_err(|_| DecodeError::BadFraming)? as usize;
            let mut messages = Vec::with_capacity(count);
            for _ in 0..count {
                let len =
                    cursor.read_u16::<BigEndian>().map_err(|_| DecodeError::BadFraming)? as usize;
                let mut bytes = vec![0u8; len];
                cursor.read_exact(&mut bytes).map_err(|_| DecodeError::BadFraming)?;
                messages.push(bytes);
            }
            Ok(Payload::Aggregate(messages))
        }
        _ => Err(DecodeError::BadFraming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let framed = encode_message(b"hello world");
        assert_eq!(decode(&framed).unwrap(), Payload::Message(b"hello world".to_vec()));
    }

    #[test]
    fn empty_message_round_trip() {
        let framed = encode_message(b"");
        assert_eq!(decode(&framed).unwrap(), Payload::Message(Vec::new()));
    }

    #[test]
    fn first_fragment_carries_count() {
        let framed = encode_fragment(9, 0, Some(4), b"abc");
        match decode(&framed).unwrap() {
            Payload::Fragment { group, index, count, bytes } => {
                assert_eq!(group, 9);
                assert_eq!(index, 0);
                assert_eq!(count, Some(4));
                assert_eq!(bytes, b"abc");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn later_fragments_omit_count() {
        let framed = encode_fragment(9, 3, None, b"tail");
        match decode(&framed).unwrap() {
            Payload::Fragment { index, count, bytes, .. } => {
                assert_eq!(index, 3);
                assert_eq!(count, None);
                assert_eq!(bytes, b"tail");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn aggregate_round_trip_preserves_order() {
        let messages = vec![b"one".to_vec(), b"two".to_vec(), Vec::new(), b"four".to_vec()];
        let framed = encode_aggregate(&messages);
        assert_eq!(decode(&framed).unwrap(), Payload::Aggregate(messages));
    }

    #[test]
    fn truncated_aggregate_is_rejected() {
        let framed = encode_aggregate(&[b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(decode(&framed[..framed.len() - 1]), Err(DecodeError::BadFraming));
    }

    #[test]
    fn zero_count_first_fragment_is_rejected() {
        // kind, group, index 0, count 0
        let bytes = [KIND_FRAG, 0, 1, 0, 0];
        assert_eq!(decode(&bytes), Err(DecodeError::BadFraming));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(decode(&[9, 1, 2, 3]), Err(DecodeError::BadFraming));
    }
}
