//! Exact-match flow classifier.
//!
//! A fixed array of hash buckets; buckets never resize, so a dump cursor's
//! `(bucket, offset)` position stays meaningful while the caller yields
//! between pages. Entries added or removed mid-dump may be seen once,
//! never, or twice; the cursor itself never goes out of bounds.

use std::hash::BuildHasher;

use bytes::Bytes;

use super::FlowKey;
use crate::error::{DpError, Result};

/// Hard cap on installed flows per datapath.
pub const MAX_FLOWS: usize = 65_536;

const N_BUCKETS: usize = 1024;

/// Per-flow counters, updated on every hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Last hit, in [`crate::time::monotonic_ms`] milliseconds.
    pub used_ms: u64,
    pub n_packets: u64,
    pub n_bytes: u64,
    /// OR of the TCP flag bytes seen by this flow.
    pub tcp_flags: u8,
}

#[derive(Debug)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub actions: Bytes,
    pub stats: FlowStats,
}

impl FlowEntry {
    pub fn record_hit(&mut self, now_ms: u64, pkt_len: usize, tcp_flags: u8) {
        self.stats.used_ms = now_ms;
        self.stats.n_packets += 1;
        self.stats.n_bytes += pkt_len as u64;
        self.stats.tcp_flags |= tcp_flags;
    }
}

/// Position of a dump between pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpCursor {
    bucket: u32,
    offset: u32,
}

pub struct FlowTable {
    buckets: Vec<Vec<FlowEntry>>,
    len: usize,
    hasher: ahash::RandomState,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            buckets: (0..N_BUCKETS).map(|_| Vec::new()).collect(),
            len: 0,
            // Fixed seeds: the bucket of a key must not move for the life of
            // the table.
            hasher: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_of(&self, key: &FlowKey) -> usize {
        (self.hasher.hash_one(key) as usize) & (N_BUCKETS - 1)
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<&FlowEntry> {
        let b = self.bucket_of(key);
        self.buckets[b].iter().find(|e| e.key == *key)
    }

    pub fn lookup_mut(&mut self, key: &FlowKey) -> Option<&mut FlowEntry> {
        let b = self.bucket_of(key);
        self.buckets[b].iter_mut().find(|e| e.key == *key)
    }

    pub fn insert(&mut self, key: FlowKey, actions: Bytes) -> Result<()> {
        if self.lookup(&key).is_some() {
            return Err(DpError::Exists);
        }
        if self.len >= MAX_FLOWS {
            return Err(DpError::TooBig("flow table full"));
        }
        let b = self.bucket_of(&key);
        self.buckets[b].push(FlowEntry {
            key,
            actions,
            stats: FlowStats::default(),
        });
        self.len += 1;
        Ok(())
    }

    /// Replace the action program of an existing flow, returning the stats
    /// from before the change. `zero_stats` resets the counters.
    pub fn modify(&mut self, key: &FlowKey, actions: Bytes, zero_stats: bool) -> Result<FlowStats> {
        let entry = self.lookup_mut(key).ok_or(DpError::NotFound)?;
        let old = entry.stats;
        entry.actions = actions;
        if zero_stats {
            entry.stats = FlowStats::default();
        }
        Ok(old)
    }

    pub fn remove(&mut self, key: &FlowKey) -> Result<FlowStats> {
        let b = self.bucket_of(key);
        let pos = self.buckets[b]
            .iter()
            .position(|e| e.key == *key)
            .ok_or(DpError::NotFound)?;
        let entry = self.buckets[b].swap_remove(pos);
        self.len -= 1;
        Ok(entry.stats)
    }

    pub fn flush(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }

    /// Return the entry at `cursor` and the cursor for the one after it, or
    /// `None` when iteration is complete.
    pub fn dump_next(&self, cursor: DumpCursor) -> Option<(&FlowEntry, DumpCursor)> {
        let mut bucket = cursor.bucket as usize;
        let mut offset = cursor.offset as usize;
        while bucket < N_BUCKETS {
            if let Some(entry) = self.buckets[bucket].get(offset) {
                let next = DumpCursor {
                    bucket: bucket as u32,
                    offset: offset as u32 + 1,
                };
                return Some((entry, next));
            }
            bucket += 1;
            offset = 0;
        }
        None
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        FlowTable::new()
    }
}
