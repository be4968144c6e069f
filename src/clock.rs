//! Chunked vector clocks for happens-before tracking.
//!
//! A vector clock maps a thread slot id to the most recent epoch counter
//! from that thread known to be ordered before the current point. Clocks
//! are sparse: a program with a handful of threads must not pay for the
//! full slot-id space on every clock. The representation is a two-level
//! array: an outer vector indexed by `tid / CLOCK_CHUNK`, with fixed
//! chunks allocated the first time a slot in their range is written:
//!
//! ```text
//! chunks: [ Some(chunk0) , None , Some(chunk2) , ... ]
//!                │                     │
//!                ▼                     ▼
//!          [u64; 256]            [u64; 256]
//! ```
//!
//! `set`/`get` for any tid are constant-time; `acquire` and `release`
//! visit only allocated chunks. An unallocated chunk reads as all-zero.

use crate::params::{Tid, CLOCK_CHUNK};

/// Sparse map from thread slot id to epoch counter.
#[derive(Debug, Default)]
pub struct VectorClock {
    chunks: Vec<Option<Box<[u64; CLOCK_CHUNK]>>>,
}

impl VectorClock {
    pub fn new() -> Self {
        VectorClock { chunks: Vec::new() }
    }

    /// Overwrite the entry for `tid`.
    pub fn set(&mut self, tid: Tid, clk: u64) {
        let chunk = self.chunk_mut(tid);
        chunk[tid as usize % CLOCK_CHUNK] = clk;
    }

    /// Read the entry for `tid`; unallocated entries are zero.
    pub fn get(&self, tid: Tid) -> u64 {
        match self.chunks.get(tid as usize / CLOCK_CHUNK) {
            Some(Some(chunk)) => chunk[tid as usize % CLOCK_CHUNK],
            _ => 0,
        }
    }

    /// Pointwise max of `other` into `self`: afterwards
    /// `self[t] >= other[t]` and `self[t] >= self_old[t]` for every `t`.
    pub fn acquire(&mut self, other: &VectorClock) {
        for (idx, src) in other.chunks.iter().enumerate() {
            let Some(src) = src else { continue };
            let dst = self.chunk_at_mut(idx);
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                if *s > *d {
                    *d = *s;
                }
            }
        }
    }

    /// Pointwise max of `self` into `other`. The caller holds whatever
    /// lock protects `other`.
    pub fn release(&self, other: &mut VectorClock) {
        for (idx, src) in self.chunks.iter().enumerate() {
            let Some(src) = src else { continue };
            let dst = other.chunk_at_mut(idx);
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                if *s > *d {
                    *d = *s;
                }
            }
        }
    }

    /// Drop all entries, returning the clock to its freshly-created state.
    pub fn reset(&mut self) {
        self.chunks.clear();
    }

    /// Iterate over populated (tid, counter) pairs with nonzero counters.
    pub fn iter(&self) -> impl Iterator<Item = (Tid, u64)> + '_ {
        self.chunks.iter().enumerate().flat_map(|(idx, chunk)| {
            chunk.iter().flat_map(move |c| {
                c.iter().enumerate().filter_map(move |(off, &clk)| {
                    (clk != 0).then(|| ((idx * CLOCK_CHUNK + off) as Tid, clk))
                })
            })
        })
    }

    fn chunk_mut(&mut self, tid: Tid) -> &mut [u64; CLOCK_CHUNK] {
        self.chunk_at_mut(tid as usize / CLOCK_CHUNK)
    }

    fn chunk_at_mut(&mut self, idx: usize) -> &mut [u64; CLOCK_CHUNK] {
        if self.chunks.len() <= idx {
            self.chunks.resize_with(idx + 1, || None);
        }
        self.chunks[idx].get_or_insert_with(|| Box::new([0; CLOCK_CHUNK]))
    }
}
