//! The `Custom` policy a plain suballocator is parameterized over (spec
//! §4.3): purely-local arenas enforce a byte ceiling and never touch the
//! paging facility; swappable-plain arenas have no ceiling but register
//! every large direct allocation with the facility so it can be evicted.
//!
//! Grounded on `purely-local_suballocator.hpp`'s `PurelyLocalCustom` and
//! `swappable_plain_suballocator.hpp`'s `SwappablePlainCustom`.

use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::{FarMallocError, Result};
use crate::store::PagingFacility;

/// Capacity bookkeeping and large-allocation hooks a plain suballocator
/// defers to its arena-kind-specific policy for.
pub trait PlainCustom {
    /// Checks whether `size` more bytes can be consumed without going over
    /// whatever ceiling this policy enforces.
    fn check_capacity(&mut self, size: usize) -> Result<()>;
    /// Records that `size` bytes were consumed (after a successful allocate).
    fn consume_capacity(&mut self, size: usize);
    /// Records that `size` bytes were returned (on deallocate).
    fn reclaim_capacity(&mut self, size: usize);
    /// Whether total occupied bytes are under `threshold` of capacity — used
    /// by callers deciding whether to keep growing this suballocator or
    /// prefer another kind. Policies with no ceiling always report `false`.
    fn is_occupancy_under(&self, threshold: f64) -> bool;
    /// Rounds a large-allocation request size, if this policy needs to.
    fn large_alloc_size(&self, size: usize) -> usize {
        size
    }
    /// Runs after a large direct allocation succeeds.
    fn postprocess_large_alloc(&mut self, _ptr: NonNull<u8>, _size: usize) {}
    /// Runs before a large direct allocation's memory is returned to the OS.
    fn preprocess_large_dealloc(&mut self, _ptr: NonNull<u8>, _size: usize) {}
}

/// Capacity-limited policy for the purely-local subspace: every byte
/// consumed, everywhere in the subspace, counts against one shared ceiling.
pub struct PurelyLocalCustom {
    occupied: usize,
    capacity: usize,
}

impl PurelyLocalCustom {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { occupied: 0, capacity }
    }
}

impl PlainCustom for PurelyLocalCustom {
    fn check_capacity(&mut self, size: usize) -> Result<()> {
        if self.occupied + size > self.capacity {
            Err(FarMallocError::OutOfMemory)
        } else {
            Ok(())
        }
    }

    fn consume_capacity(&mut self, size: usize) {
        self.occupied += size;
    }

    fn reclaim_capacity(&mut self, size: usize) {
        self.occupied -= size;
    }

    fn is_occupancy_under(&self, threshold: f64) -> bool {
        (self.occupied as f64) < threshold * (self.capacity as f64)
    }
}

/// Uncapped policy for the swappable-plain subspace: every large direct
/// allocation is registered with the paging facility so it can be evicted
/// once far-memory mode is on.
pub struct SwappablePlainCustom {
    facility: Rc<dyn PagingFacility>,
}

impl SwappablePlainCustom {
    #[must_use]
    pub fn new(facility: Rc<dyn PagingFacility>) -> Self {
        Self { facility }
    }
}

impl PlainCustom for SwappablePlainCustom {
    fn check_capacity(&mut self, _size: usize) -> Result<()> {
        Ok(())
    }

    fn consume_capacity(&mut self, _size: usize) {}
    fn reclaim_capacity(&mut self, _size: usize) {}

    fn is_occupancy_under(&self, _threshold: f64) -> bool {
        false
    }

    fn postprocess_large_alloc(&mut self, ptr: NonNull<u8>, size: usize) {
        self.facility.register_region(ptr, size);
    }

    fn preprocess_large_dealloc(&mut self, ptr: NonNull<u8>, _size: usize) {
        self.facility.unregister_region(ptr);
    }
}
