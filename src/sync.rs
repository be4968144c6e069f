//! Shadows of user-level synchronization objects.
//!
//! Every mutex, condition variable, semaphore or barrier the traced
//! program touches gets a [`SyncVar`] keyed by its address, carrying the
//! vector clock that transports happens-before edges across threads:
//! the release side merges its clock into the SyncVar, the acquire side
//! merges the SyncVar's clock into its own.
//!
//! The table is partitioned; each partition guards its bucket with a
//! read/write lock so lookups of hot, already-created objects take only
//! a read lock. Lookup misses upgrade to a write lock and re-scan, since
//! another thread may have inserted the object in between.

use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::clock::VectorClock;
use crate::params::{Tid, SYNC_PARTS};

/// Mutable state of a synchronization object, guarded by its own lock.
#[derive(Debug, Default)]
pub struct SyncState {
    /// Happens-before clock released into this object.
    pub clock: VectorClock,
    /// Owning thread slot, for write-locked mutexes.
    pub owner_tid: Option<Tid>,
    /// Write-lock recursion depth of the owner.
    pub recursion: u32,
    pub is_rw: bool,
    pub is_recursive: bool,
    /// Set when the object saw an impossible operation (double lock of a
    /// non-recursive mutex, unlock by a non-owner). Further misuse of a
    /// broken object is not re-reported.
    pub is_broken: bool,
    /// Configured party count, for barriers.
    pub barrier_count: u32,
    /// Arrivals in the current barrier round.
    pub barrier_arrived: u32,
}

/// Engine shadow of one user-visible synchronization object.
#[derive(Debug)]
pub struct SyncVar {
    pub addr: u64,
    /// Stack of the thread that first touched the object.
    pub creation_stack: Vec<u64>,
    pub state: RwLock<SyncState>,
}

impl SyncVar {
    fn new(addr: u64, creation_stack: Vec<u64>) -> Self {
        SyncVar {
            addr,
            creation_stack,
            state: RwLock::new(SyncState::default()),
        }
    }
}

/// Address-keyed table of synchronization objects.
pub struct SyncTab {
    parts: Vec<RwLock<Vec<Arc<SyncVar>>>>,
}

impl SyncTab {
    pub fn new() -> Self {
        SyncTab {
            parts: (0..SYNC_PARTS).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn part(&self, addr: u64) -> &RwLock<Vec<Arc<SyncVar>>> {
        &self.parts[((addr >> 3) as usize) % SYNC_PARTS]
    }

    /// The SyncVar for `addr`, created on first use. `creation_stack` is
    /// only consulted when the object does not exist yet.
    pub fn get_or_create(
        &self,
        addr: u64,
        creation_stack: impl FnOnce() -> Vec<u64>,
    ) -> Arc<SyncVar> {
        let part = self.part(addr);
        {
            let bucket = part.read().unwrap();
            if let Some(sv) = bucket.iter().find(|sv| sv.addr == addr) {
                return Arc::clone(sv);
            }
        }
        let mut bucket = part.write().unwrap();
        if let Some(sv) = bucket.iter().find(|sv| sv.addr == addr) {
            return Arc::clone(sv);
        }
        debug!(addr, "sync object created");
        let sv = Arc::new(SyncVar::new(addr, creation_stack()));
        bucket.push(Arc::clone(&sv));
        sv
    }

    /// Look up without creating.
    pub fn get(&self, addr: u64) -> Option<Arc<SyncVar>> {
        let bucket = self.part(addr).read().unwrap();
        bucket.iter().find(|sv| sv.addr == addr).map(Arc::clone)
    }

    /// Detach the SyncVar for `addr` and hand it to the caller. Briefly
    /// write-locks its state so no other thread still holds it when
    /// ownership transfers.
    pub fn get_and_remove(&self, addr: u64) -> Option<Arc<SyncVar>> {
        let sv = {
            let mut bucket = self.part(addr).write().unwrap();
            let idx = bucket.iter().position(|sv| sv.addr == addr)?;
            bucket.swap_remove(idx)
        };
        drop(sv.state.write().unwrap());
        debug!(addr, "sync object removed");
        Some(sv)
    }

    /// Drop every SyncVar whose address lies in `[begin, end)`. Used
    /// when the underlying memory is freed.
    pub fn remove_range(&self, begin: u64, end: u64) {
        for part in &self.parts {
            let mut bucket = part.write().unwrap();
            bucket.retain(|sv| sv.addr < begin || sv.addr >= end);
        }
    }
}

impl Default for SyncTab {
    fn default() -> Self {
        SyncTab::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_use_creates_later_uses_share() {
        let tab = SyncTab::new();
        let a = tab.get_or_create(0x100, || vec![1, 2]);
        let b = tab.get_or_create(0x100, || vec![9, 9]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.creation_stack, vec![1, 2]);
    }

    #[test]
    fn distinct_addresses_get_distinct_objects() {
        let tab = SyncTab::new();
        let a = tab.get_or_create(0x100, Vec::new);
        let b = tab.get_or_create(0x108, Vec::new);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_detaches() {
        let tab = SyncTab::new();
        tab.get_or_create(0x200, Vec::new);
        let removed = tab.get_and_remove(0x200).unwrap();
        assert_eq!(removed.addr, 0x200);
        assert!(tab.get(0x200).is_none());
        assert!(tab.get_and_remove(0x200).is_none());
    }

    #[test]
    fn remove_range_reaps_contained_objects() {
        let tab = SyncTab::new();
        tab.get_or_create(0x1000, Vec::new);
        tab.get_or_create(0x1010, Vec::new);
        tab.get_or_create(0x2000, Vec::new);
        tab.remove_range(0x1000, 0x1800);
        assert!(tab.get(0x1000).is_none());
        assert!(tab.get(0x1010).is_none());
        assert!(tab.get(0x2000).is_some());
    }

    #[test]
    fn clock_state_persists_across_lookups() {
        let tab = SyncTab::new();
        {
            let sv = tab.get_or_create(0x300, Vec::new);
            sv.state.write().unwrap().clock.set(3, 7);
        }
        let sv = tab.get_or_create(0x300, Vec::new);
        assert_eq!(sv.state.read().unwrap().clock.get(3), 7);
    }

    #[test]
    fn addresses_in_same_partition_are_separate() {
        let tab = SyncTab::new();
        // Same partition index by construction.
        let a = 0x40;
        let b = a + (SYNC_PARTS as u64) * 8;
        tab.get_or_create(a, Vec::new);
        tab.get_or_create(b, Vec::new);
        assert!(!Arc::ptr_eq(&tab.get(a).unwrap(), &tab.get(b).unwrap()));
    }
}
