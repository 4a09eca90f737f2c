//! Userspace-paging bridge, a.k.a. the "local memory store" (spec §4.2, §6).
//!
//! The real external paging library this crate plugs into (observable here
//! only through its contract) mmaps a region backed by an arbitrary `Store`
//! and stays out of our way until the process enters far-memory mode, at
//! which point every registered region's pages may be transparently evicted
//! and faulted back in. We model that contract as [`PagingFacility`]: a
//! process-wide table of registered regions (each owning a local backing
//! buffer, grounded on `local_memory_store.hpp`'s `LocalMemoryStore`), a
//! far-memory-mode flag, and read/write counters, so the rest of the crate
//! can depend on the trait rather than the concrete paging library.
//!
//! [`NullPagingFacility`] is the test double used when no real paging library
//! is linked in. It still performs the byte-copies the contract promises —
//! on activation every registered region's bytes are written out to its
//! backing buffer, and on deactivation every region is read back from its
//! backing buffer — but since there is no real page-fault delivery in this
//! process, the pages are never actually unmapped in between: the copies
//! exist to keep `read_cnt`/`write_cnt` and the backing buffers faithful to
//! what the real facility would do, not to reclaim memory.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::params::PAGE_SIZE;

/// The contract the real external paging library satisfies: register/
/// unregister arena-sized regions, and flip the process in and out of
/// far-memory mode.
pub trait PagingFacility {
    /// Registers `[ptr, ptr+size)` as a region the facility should manage
    /// once far-memory mode is entered.
    fn register_region(&self, ptr: NonNull<u8>, size: usize);

    /// Unregisters a previously-registered region. `ptr` must be a pointer
    /// passed to a prior [`PagingFacility::register_region`] call.
    fn unregister_region(&self, ptr: NonNull<u8>);

    /// Flips far-memory mode on (or off, if already on) and returns the new
    /// state. While on, registered regions are subject to eviction; while
    /// off, every registered region's full working set is resident.
    fn toggle_far_memory_mode(&self) -> bool;

    /// Whether far-memory mode is currently on.
    fn is_far_memory_mode(&self) -> bool;

    /// Cumulative count of store reads serviced since construction.
    fn read_count(&self) -> u64;

    /// Cumulative count of store writes serviced since construction.
    fn write_count(&self) -> u64;
}

struct RegionEntry {
    size: usize,
    /// The region's local backing buffer (`LocalMemoryStore::backing_data`):
    /// a byte-for-byte copy of the region as of the last time it was paged
    /// out, restored into the region the next time it is paged back in.
    backing: Vec<u8>,
}

/// Test-double [`PagingFacility`]: tracks the mapping table and mode flag
/// faithfully, and performs the same backing-buffer byte-copies and counter
/// increments the real facility's page-fault callbacks would, one page at a
/// time. It never actually unmaps a page in between, since there is no real
/// page-fault delivery to service in this process — every read/write to a
/// registered region while far-memory mode is on is still local DRAM access.
#[derive(Default)]
pub struct NullPagingFacility {
    mapping: Mutex<HashMap<usize, RegionEntry>>,
    far_memory_mode: AtomicBool,
    read_cnt: AtomicU64,
    write_cnt: AtomicU64,
}

impl NullPagingFacility {
    /// Creates an empty facility, with far-memory mode off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The size a region starting at `ptr` was registered with, if any.
    #[must_use]
    pub fn registered_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let mapping = self.mapping.lock().expect("mapping mutex poisoned");
        mapping.get(&(ptr.as_ptr() as usize)).map(|entry| entry.size)
    }

    /// Services a page-fault write by copying one page from `base` into
    /// `entry`'s backing buffer at `page_idx`, as `LocalMemoryStore::write_to_store`
    /// would when the paging library evicts that page. Increments `write_cnt`.
    ///
    /// # Safety
    /// `base` must be valid for reads of `entry.size` bytes and `page_idx`
    /// must be within that region.
    unsafe fn write_to_store(&self, entry: &mut RegionEntry, base: *const u8, page_idx: usize) {
        let off = page_idx * PAGE_SIZE;
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(off), entry.backing.as_mut_ptr().add(off), PAGE_SIZE);
        }
        self.write_cnt.fetch_add(1, Ordering::Relaxed);
    }

    /// Services a page-fault read by copying one page from `entry`'s backing
    /// buffer back into `base` at `page_idx`, as `LocalMemoryStore::read_from_store`
    /// would when the paging library faults that page back in. Increments `read_cnt`.
    ///
    /// # Safety
    /// `base` must be valid for writes of `entry.size` bytes and `page_idx`
    /// must be within that region.
    unsafe fn read_from_store(&self, entry: &RegionEntry, base: *mut u8, page_idx: usize) {
        let off = page_idx * PAGE_SIZE;
        unsafe {
            std::ptr::copy_nonoverlapping(entry.backing.as_ptr().add(off), base.add(off), PAGE_SIZE);
        }
        self.read_cnt.fetch_add(1, Ordering::Relaxed);
    }
}

impl PagingFacility for NullPagingFacility {
    fn register_region(&self, ptr: NonNull<u8>, size: usize) {
        debug!(ptr = ?ptr.as_ptr(), size, "registering region with paging facility");
        debug_assert!(size.is_multiple_of(PAGE_SIZE));
        let mut entry = RegionEntry { size, backing: vec![0u8; size] };
        // If far-memory mode is already active, this region is installed
        // straight into it: page it out immediately, the same as every
        // already-registered region was when mode switched on.
        if self.is_far_memory_mode() {
            let n_pages = size / PAGE_SIZE;
            for page_idx in 0..n_pages {
                unsafe { self.write_to_store(&mut entry, ptr.as_ptr(), page_idx) };
            }
        }
        let mut mapping = self.mapping.lock().expect("mapping mutex poisoned");
        mapping.insert(ptr.as_ptr() as usize, entry);
    }

    fn unregister_region(&self, ptr: NonNull<u8>) {
        let mut mapping = self.mapping.lock().expect("mapping mutex poisoned");
        mapping.remove(&(ptr.as_ptr() as usize));
    }

    fn toggle_far_memory_mode(&self) -> bool {
        let mut mapping = self.mapping.lock().expect("mapping mutex poisoned");
        let now = !self.far_memory_mode.fetch_xor(true, Ordering::AcqRel);
        for (&base, entry) in mapping.iter_mut() {
            let n_pages = entry.size / PAGE_SIZE;
            for page_idx in 0..n_pages {
                if now {
                    unsafe { self.write_to_store(entry, base as *const u8, page_idx) };
                } else {
                    unsafe { self.read_from_store(entry, base as *mut u8, page_idx) };
                }
            }
        }
        debug!(far_memory_mode = now, "toggled far memory mode");
        now
    }

    fn is_far_memory_mode(&self) -> bool {
        self.far_memory_mode.load(Ordering::Acquire)
    }

    fn read_count(&self) -> u64 {
        self.read_cnt.load(Ordering::Relaxed)
    }

    fn write_count(&self) -> u64 {
        self.write_cnt.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_local_mode() {
        let facility = NullPagingFacility::new();
        assert!(!facility.is_far_memory_mode());
    }

    #[test]
    fn toggle_is_a_round_trip() {
        let facility = NullPagingFacility::new();
        assert!(facility.toggle_far_memory_mode());
        assert!(facility.is_far_memory_mode());
        assert!(!facility.toggle_far_memory_mode());
        assert!(!facility.is_far_memory_mode());
    }

    #[test]
    fn register_then_unregister_clears_the_mapping() {
        let facility = NullPagingFacility::new();
        let mut buf = vec![0u8; PAGE_SIZE];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        facility.register_region(ptr, PAGE_SIZE);
        assert_eq!(facility.registered_size(ptr), Some(PAGE_SIZE));
        facility.unregister_region(ptr);
        assert_eq!(facility.registered_size(ptr), None);
    }

    #[test]
    fn toggle_pages_a_region_out_and_back_byte_for_byte() {
        let facility = NullPagingFacility::new();
        let mut buf = vec![0xABu8; 2 * PAGE_SIZE];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        facility.register_region(ptr, buf.len());

        assert!(facility.toggle_far_memory_mode());
        assert_eq!(facility.write_count(), 2);
        assert_eq!(facility.read_count(), 0);

        assert!(!facility.toggle_far_memory_mode());
        assert_eq!(facility.write_count(), 2);
        assert_eq!(facility.read_count(), 2);
        assert_eq!(buf, vec![0xABu8; 2 * PAGE_SIZE]);
    }

    #[test]
    fn registering_while_active_pages_the_new_region_out_immediately() {
        let facility = NullPagingFacility::new();
        facility.toggle_far_memory_mode();

        let mut buf = vec![0u8; PAGE_SIZE];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        facility.register_region(ptr, PAGE_SIZE);
        assert_eq!(facility.write_count(), 1);
    }
}
