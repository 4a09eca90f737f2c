//! The collective allocator and its client-facing traits protocol (spec
//! §4.6, §4.7), grounded on `collective_allocator.hpp`'s
//! `CollectiveAllocatorImpl`/`Suballocator` and
//! `collective_allocator_traits.hpp`'s `batch_allocate`/`relocate`.
//!
//! `SuballocatorKind` is chosen by the *caller*, not auto-balanced by size:
//! a client container picks `PurelyLocal` for data it wants to keep hot,
//! `SwappablePlain` for bulk data it's fine seeing evicted, and `NewPerPage`
//! for small, frequently-allocated nodes it wants clustered together. See
//! `DESIGN.md` for why `NewPerPage` is backed by [`crate::hint::HintAllocator`]
//! rather than the exclusive-handle [`crate::perpage::PerPageBlockAllocator`].

pub mod traits;

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::Result;
use crate::hint::HintAllocator;
use crate::params::{arena_offset_of, PER_PAGE_OFFSET, PURELY_LOCAL_OFFSET, SWAPPABLE_PLAIN_OFFSET};
use crate::plain::{PurelyLocalSuballocator, SwappablePlainSuballocator};
use crate::store::{NullPagingFacility, PagingFacility};

/// Which of the three subspaces a suballocator handle (or a pointer)
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuballocatorKind {
    PurelyLocal,
    SwappablePlain,
    NewPerPage,
}

impl SuballocatorKind {
    /// Recovers the kind a pointer's high bits identify it as belonging to
    /// (spec §3's fundamental dispatch invariant).
    #[must_use]
    pub fn of_ptr(ptr: *const u8) -> Self {
        match arena_offset_of(ptr) {
            PURELY_LOCAL_OFFSET => SuballocatorKind::PurelyLocal,
            SWAPPABLE_PLAIN_OFFSET => SuballocatorKind::SwappablePlain,
            PER_PAGE_OFFSET => SuballocatorKind::NewPerPage,
            other => unreachable!("pointer offset {other:#x} matches no known suballocator kind"),
        }
    }
}

struct Engine<const BLOCK_SIZE: usize> {
    purely_local: PurelyLocalSuballocator,
    swappable_plain: SwappablePlainSuballocator,
    new_per_page: HintAllocator<BLOCK_SIZE>,
    facility: Rc<dyn PagingFacility>,
}

/// The top-level façade: a cheap, reference-counted handle over an engine
/// that owns one suballocator of each kind.
pub struct CollectiveAllocator<const BLOCK_SIZE: usize> {
    engine: Rc<RefCell<Engine<BLOCK_SIZE>>>,
}

impl<const BLOCK_SIZE: usize> Clone for CollectiveAllocator<BLOCK_SIZE> {
    fn clone(&self) -> Self {
        Self { engine: Rc::clone(&self.engine) }
    }
}

impl<const BLOCK_SIZE: usize> CollectiveAllocator<BLOCK_SIZE> {
    /// Creates an engine whose purely-local subspace is capped at
    /// `purely_local_capacity` bytes, using an in-process test double for
    /// the paging facility.
    #[must_use]
    pub fn new(purely_local_capacity: usize) -> Self {
        Self::with_facility(purely_local_capacity, Rc::new(NullPagingFacility::new()))
    }

    /// As [`Self::new`], but with a caller-supplied paging facility (for
    /// swapping in a real far-memory backend).
    #[must_use]
    pub fn with_facility(purely_local_capacity: usize, facility: Rc<dyn PagingFacility>) -> Self {
        let engine = Engine {
            purely_local: PurelyLocalSuballocator::new(purely_local_capacity),
            swappable_plain: SwappablePlainSuballocator::new(Rc::clone(&facility)),
            new_per_page: HintAllocator::new(),
            facility,
        };
        Self { engine: Rc::new(RefCell::new(engine)) }
    }

    /// Allocates `size` bytes from the purely-local subspace while it's
    /// under 90% of capacity, falling back to the swappable-plain subspace
    /// once it crosses that threshold.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let prefer_local = self.engine.borrow().purely_local.is_occupancy_under(0.9);
        if prefer_local {
            if let Ok(ptr) = self.engine.borrow_mut().purely_local.allocate_local(size) {
                return Ok(ptr);
            }
        }
        self.get_suballocator(SuballocatorKind::SwappablePlain).allocate(size)
    }

    /// Deallocates a pointer previously returned by this engine, recovering
    /// which subspace owns it from its address alone.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.get_suballocator(SuballocatorKind::of_ptr(ptr.as_ptr())).deallocate(ptr, size);
    }

    /// Obtains a handle scoped to one specific suballocator kind.
    #[must_use]
    pub fn get_suballocator(&self, kind: SuballocatorKind) -> Suballocator<BLOCK_SIZE> {
        Suballocator { engine: Rc::clone(&self.engine), kind }
    }

    /// Obtains the suballocator handle that owns `ptr`.
    #[must_use]
    pub fn get_suballocator_for(&self, ptr: NonNull<u8>) -> Suballocator<BLOCK_SIZE> {
        self.get_suballocator(SuballocatorKind::of_ptr(ptr.as_ptr()))
    }
}

/// A handle scoped to one [`SuballocatorKind`] of a [`CollectiveAllocator`]'s
/// engine — the tagged-union `SuballocatorImpl` of the original, minus the
/// `std::variant`: dispatch is a plain match on `kind` against the one
/// shared engine every handle and the top-level façade point at.
pub struct Suballocator<const BLOCK_SIZE: usize> {
    engine: Rc<RefCell<Engine<BLOCK_SIZE>>>,
    kind: SuballocatorKind,
}

impl<const BLOCK_SIZE: usize> Clone for Suballocator<BLOCK_SIZE> {
    fn clone(&self) -> Self {
        Self { engine: Rc::clone(&self.engine), kind: self.kind }
    }
}

impl<const BLOCK_SIZE: usize> Suballocator<BLOCK_SIZE> {
    /// Allocates `size` bytes from this specific subspace.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let mut engine = self.engine.borrow_mut();
        match self.kind {
            SuballocatorKind::PurelyLocal => engine.purely_local.allocate_local(size),
            SuballocatorKind::SwappablePlain => {
                let facility = Rc::clone(&engine.facility);
                engine.swappable_plain.allocate_swappable(size, facility)
            }
            SuballocatorKind::NewPerPage => {
                let hint_alloc = engine.new_per_page.clone();
                drop(engine);
                hint_alloc.allocate(size)
            }
        }
    }

    /// Allocates `size` bytes, preferring to land near `hint` — only
    /// meaningful for [`SuballocatorKind::NewPerPage`]; other kinds ignore
    /// the hint and behave like [`Self::allocate`].
    pub fn allocate_with_hint(&self, size: usize, hint: NonNull<u8>) -> Result<NonNull<u8>> {
        match self.kind {
            SuballocatorKind::NewPerPage => {
                let hint_alloc = self.engine.borrow().new_per_page.clone();
                hint_alloc.allocate_with_hint(size, hint)
            }
            _ => self.allocate(size),
        }
    }

    /// Deallocates a pointer this specific subspace owns.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let mut engine = self.engine.borrow_mut();
        match self.kind {
            SuballocatorKind::PurelyLocal => engine.purely_local.deallocate(ptr, size),
            SuballocatorKind::SwappablePlain => engine.swappable_plain.deallocate(ptr, size),
            SuballocatorKind::NewPerPage => {
                let hint_alloc = engine.new_per_page.clone();
                drop(engine);
                hint_alloc.deallocate(ptr, size);
            }
        }
    }

    /// Whether `ptr` belongs to this specific subspace.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        SuballocatorKind::of_ptr(ptr) == self.kind
    }

    /// Whether this subspace's occupancy is under `threshold` of whatever
    /// ceiling it enforces (always `false` for uncapped kinds).
    #[must_use]
    pub fn is_occupancy_under(&self, threshold: f64) -> bool {
        match self.kind {
            SuballocatorKind::PurelyLocal => self.engine.borrow().purely_local.is_occupancy_under(threshold),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ARENA_SIZE;

    #[test]
    fn purely_local_roundtrips() {
        let engine = CollectiveAllocator::<4096>::new(4 * ARENA_SIZE);
        let ptr = engine.allocate(64).unwrap();
        assert_eq!(SuballocatorKind::of_ptr(ptr.as_ptr()), SuballocatorKind::PurelyLocal);
        engine.deallocate(ptr, 64);
    }

    #[test]
    fn explicit_kind_selection_is_honored() {
        let engine = CollectiveAllocator::<4096>::new(4 * ARENA_SIZE);
        let swap = engine.get_suballocator(SuballocatorKind::SwappablePlain);
        let ptr = swap.allocate(64).unwrap();
        assert_eq!(SuballocatorKind::of_ptr(ptr.as_ptr()), SuballocatorKind::SwappablePlain);
        swap.deallocate(ptr, 64);
    }

    #[test]
    fn new_per_page_handle_allocates() {
        let engine = CollectiveAllocator::<4096>::new(4 * ARENA_SIZE);
        let per_page = engine.get_suballocator(SuballocatorKind::NewPerPage);
        let ptr = per_page.allocate(32).unwrap();
        assert_eq!(SuballocatorKind::of_ptr(ptr.as_ptr()), SuballocatorKind::NewPerPage);
        per_page.deallocate(ptr, 32);
    }

    #[test]
    fn falls_back_to_swappable_plain_once_purely_local_is_saturated() {
        let engine = CollectiveAllocator::<4096>::new(ARENA_SIZE);
        let mut kinds_seen = std::collections::HashSet::new();
        let mut ptrs = Vec::new();
        for _ in 0..400 {
            let ptr = engine.allocate(4096).unwrap();
            kinds_seen.insert(SuballocatorKind::of_ptr(ptr.as_ptr()));
            ptrs.push(ptr);
        }
        assert!(kinds_seen.contains(&SuballocatorKind::SwappablePlain));
        for ptr in ptrs {
            engine.deallocate(ptr, 4096);
        }
    }
}
