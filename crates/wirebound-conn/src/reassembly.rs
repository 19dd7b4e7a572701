//! Fragment reassembly.
//!
//! Oversized messages arrive as fragments sharing a group id. Each group
//! gets a buffer on first contact; fragments may land in any order, and the
//! original message is rebuilt once indices `0..count-1` are all present.
//! Groups that never complete are expired on the retry sweep so a lossy or
//! malicious peer cannot grow the buffer without bound.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::warn;

/// Collects the fragments of one oversized message.
#[derive(Debug)]
struct FragmentGroup {
    /// Total fragments expected; learned from index 0, which may not be
    /// the first to arrive.
    expected: Option<u8>,
    /// Fragments received so far, by index.
    fragments: HashMap<u8, Vec<u8>>,
    /// When the group was created, for expiry.
    created_at: Instant,
}

impl FragmentGroup {
    fn new(created_at: Instant) -> Self {
        Self { expected: None, fragments: HashMap::new(), created_at }
    }

    fn is_complete(&self) -> bool {
        match self.expected {
            Some(count) => self.fragments.len() == count as usize,
            None => false,
        }
    }

    fn reassemble(mut self) -> Option<Vec<u8>> {
        let count = self.expected?;
        let mut message = Vec::new();
        for index in 0..count {
            message.extend_from_slice(&self.fragments.remove(&index)?);
        }
        Some(message)
    }
}

/// Tracks all in-progress fragment groups for one connection.
#[derive(Debug, Default)]
pub struct Reassembly {
    groups: HashMap<u16, FragmentGroup>,
}

impl Reassembly {
    /// Creates an empty reassembly table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups currently buffered.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Records one fragment. Returns the reassembled message when this
    /// fragment completes its group; the group buffer is destroyed then.
    pub fn insert(
        &mut self,
        group: u16,
        index: u8,
        count: Option<u8>,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let entry = self.groups.entry(group).or_insert_with(|| FragmentGroup::new(now));
        if let Some(count) = count {
            entry.expected = Some(count);
        }
        entry.fragments.insert(index, bytes);

        if entry.is_complete() {
            let group = self.groups.remove(&group)?;
            group.reassemble()
        } else {
            None
        }
    }

    /// Drops groups older than `timeout`. Returns how many were removed.
    pub fn expire_stale(&mut self, now: Instant, timeout: Duration) -> usize {
        let stale: Vec<u16> = self
            .groups
            .iter()
            .filter(|(_, g)| now.duration_since(g.created_at) > timeout)
            .map(|(id, _)| *id)
            .collect();
        if !stale.is_empty() {
            warn!("expiring {} incomplete fragment group(s)", stale.len());
            for id in &stale {
                self.groups.remove(id);
            }
        }
        stale.len()
    }
}
