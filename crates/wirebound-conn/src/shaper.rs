//! Outbound message shaping: aggregation and fragmentation.
//!
//! Application messages queue here before becoming packets. When the
//! window opens, the shaper turns the queue head into framed payloads:
//! several small messages coalesce into one aggregate, an oversized
//! message splits into a fragment group, and anything else rides alone.

use std::collections::VecDeque;

use wirebound_protocol::payload::{
    self, fragment_overhead, AGG_BASE_OVERHEAD, AGG_ENTRY_OVERHEAD, MSG_OVERHEAD,
};

/// Most entries one aggregate payload can carry (count field is a byte).
const MAX_AGGREGATED: usize = u8::MAX as usize;

/// Pending outbound messages plus the fragment-group allocator.
#[derive(Debug, Default)]
pub(crate) struct Shaper {
    pending: VecDeque<Vec<u8>>,
    next_group: u16,
}

impl Shaper {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues one application message in send order.
    pub(crate) fn enqueue(&mut self, message: Vec<u8>) {
        self.pending.push_back(message);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Packets a message of `len` bytes will occupy given the payload cap.
    pub(crate) fn packets_needed(len: usize, max_payload: usize) -> usize {
        if MSG_OVERHEAD + len <= max_payload {
            1
        } else {
            len.div_ceil(max_payload - fragment_overhead(true))
        }
    }

    /// Produces up to `budget` framed payloads from the queue head.
    ///
    /// A fragment group is emitted whole or not at all, so a message never
    /// straddles two window openings with a half-sent group.
    pub(crate) fn next_payloads(&mut self, max_payload: usize, budget: usize) -> Vec<Vec<u8>> {
        debug_assert!(max_payload > fragment_overhead(true));
        let mut payloads = Vec::new();

        while payloads.len() < budget {
            let Some(front) = self.pending.front() else { break };

            if MSG_OVERHEAD + front.len() > max_payload {
                let chunk = max_payload - fragment_overhead(true);
                let count = front.len().div_ceil(chunk);
                if count > budget - payloads.len() {
                    break;
                }
                let message = self.pending.pop_front().unwrap();
                let group = self.next_group;
                self.next_group = self.next_group.wrapping_add(1);
                for (index, part) in message.chunks(chunk).enumerate() {
                    let first = index == 0;
                    payloads.push(payload::encode_fragment(
                        group,
                        index as u8,
                        first.then_some(count as u8),
                        part,
                    ));
                }
            } else {
                // Greedily pull small queued messages into one aggregate.
                let mut take = 1;
                let mut size = AGG_BASE_OVERHEAD + AGG_ENTRY_OVERHEAD + front.len();
                while take < self.pending.len() && take < MAX_AGGREGATED {
                    let next = &self.pending[take];
                    if MSG_OVERHEAD + next.len() > max_payload
                        || size + AGG_ENTRY_OVERHEAD + next.len() > max_payload
                    {
                        break;
                    }
                    size += AGG_ENTRY_OVERHEAD + next.len();
                    take += 1;
                }

                if take >= 2 {
                    let batch: Vec<Vec<u8>> = self.pending.drain(..take).collect();
                    payloads.push(payload::encode_aggregate(&batch));
                } else {
                    let message = self.pending.pop_front().unwrap();
                    payloads.push(payload::encode_message(&message));
                }
            }
        }

        payloads
    }
}
