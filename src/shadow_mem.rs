//! Direct-mapped shadow memory.
//!
//! Every application address maps to a shadow cell by address arithmetic
//! alone, with no hashing and no probing:
//!
//! ```text
//! cell_index = (addr & APP_MASK) / SHADOW_CELL
//! cell       = base + cell_index * SHADOW_CNT * 8 bytes
//! ```
//!
//! The backing store is a single anonymous mmap reservation. The kernel
//! commits pages only when the corresponding application memory is first
//! accessed, so the large reservation costs address space, not RAM.
//!
//! Cells are arrays of `AtomicU64` slots read with relaxed loads and
//! written with release stores. Concurrent updates of one cell may lose
//! a slot to each other; that only lowers the probability of observing a
//! race later, it cannot manufacture one, since a report additionally
//! requires the vector-clock comparison to fail.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use memmap2::MmapMut;

use crate::params::{APP_MASK, SHADOW_CELL, SHADOW_CNT, SHADOW_SIZE};

/// The shadow region and its address mapping.
pub struct ShadowMem {
    map: MmapMut,
}

impl ShadowMem {
    /// Reserve the shadow region.
    pub fn new() -> Result<Self> {
        let map = MmapMut::map_anon(SHADOW_SIZE)
            .context("failed to reserve shadow memory region")?;
        Ok(ShadowMem { map })
    }

    /// The shadow cell covering `addr`, as its slot array.
    pub fn cell(&self, addr: u64) -> &[AtomicU64] {
        let idx = ((addr & APP_MASK) / SHADOW_CELL) as usize;
        let byte_off = idx * SHADOW_CNT * 8;
        debug_assert!(byte_off + SHADOW_CNT * 8 <= SHADOW_SIZE);
        // The mmap base is page-aligned and the offset is a multiple of 8,
        // so the slot pointer is always properly aligned for AtomicU64.
        unsafe {
            let base = self.map.as_ptr().add(byte_off) as *const AtomicU64;
            std::slice::from_raw_parts(base, SHADOW_CNT)
        }
    }

    /// Zero the shadow of `[addr, addr + size)`, publishing the range as
    /// freshly initialized with no prior access history.
    pub fn reset_range(&self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        let begin = addr & !(SHADOW_CELL - 1);
        let end = addr + size;
        let mut a = begin;
        while a < end {
            for slot in self.cell(a) {
                slot.store(0, Ordering::Relaxed);
            }
            a += SHADOW_CELL;
        }
    }
}
