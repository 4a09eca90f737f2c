//! The per-page suballocator and block allocator (spec §4.4), grounded on
//! `per-page_suballocator.hpp`'s `PerPageSuballocatorTemplate` and
//! `PerPageBlockAllocatorTemplate`.
//!
//! `BLOCK_SIZE` is a const generic, mirroring the original's template
//! parameter (spec §9's monomorphization design note) rather than a runtime
//! value — each distinct block size the process uses gets its own
//! monomorphized allocator, just as the C++ original gets its own template
//! instantiation.

pub mod arena;

use std::ptr::NonNull;

use crate::error::Result;
use crate::kr::{unit_size, FreeHeader, KrFreeList};
use crate::params::PER_PAGE_OFFSET;

use arena::PerPageArena;

type Idx = u32;

/// A claimed block, exposing the classic K&R free-list allocator threaded
/// through its bytes.
pub struct PerPageSuballocator<const BLOCK_SIZE: usize> {
    arena_idx: usize,
    block_idx: usize,
    base_ptr: *mut u8,
    list: KrFreeList<Idx>,
    usage: usize,
}

impl<const BLOCK_SIZE: usize> PerPageSuballocator<BLOCK_SIZE> {
    fn new(arena_idx: usize, block_idx: usize, block_ptr: *mut u8) -> Self {
        let unit = unit_size::<Idx>();
        assert!(BLOCK_SIZE >= unit * 2 && BLOCK_SIZE.is_multiple_of(unit));
        let n_units = BLOCK_SIZE / unit;
        // SAFETY: `block_ptr` is the exclusive base of a just-claimed block,
        // valid for `BLOCK_SIZE` bytes for as long as this handle exists.
        let mut list = unsafe { KrFreeList::<Idx>::new_empty(block_ptr.cast::<FreeHeader<Idx>>(), n_units) };
        list.free_run(0, n_units);
        Self { arena_idx, block_idx, base_ptr: block_ptr, list, usage: 0 }
    }

    /// Allocates `size` bytes from this block.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let unit = unit_size::<Idx>();
        let n_units = size.div_ceil(unit);
        let idx = self.list.alloc_run(n_units)?;
        self.usage += n_units;
        let ptr = unsafe { self.base_ptr.add(idx * unit) };
        NonNull::new(ptr)
    }

    /// Returns a previously-allocated `size`-byte pointer to this block.
    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let unit = unit_size::<Idx>();
        let n_units = size.div_ceil(unit);
        let idx = (ptr.as_ptr() as usize - self.base_ptr as usize) / unit;
        self.list.free_run(idx, n_units);
        self.usage -= n_units;
    }

    /// Fraction of this block's unit capacity currently allocated, or `0.0`
    /// once every unit has been freed back.
    ///
    /// The denominator is `n_units - 1`, not `n_units`: one unit is a
    /// [`FreeHeader`]-sized slot reserved for free-list bookkeeping rather
    /// than usable payload, so the comparison is against `BlockSize -
    /// sizeof(FreeHeader)` in `FreeHeader` units, matching the original.
    #[must_use]
    pub fn is_occupancy_under(&self, threshold: f64) -> bool {
        let n_units = BLOCK_SIZE / unit_size::<Idx>();
        (self.usage as f64) < threshold * ((n_units - 1) as f64)
    }

    /// Whether this block currently holds no live allocations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.usage == 0
    }
}

/// Owns every per-page arena of one block size and hands out claimed blocks
/// as [`PerPageSuballocator`] handles.
///
/// `None` slots are arenas reclaimed once every block in them was released
/// (spec §4.4's `num_of_used_blocks == 0`); a later arena reuses the slot
/// index instead of growing the vector, so it never disturbs the `arena_idx`
/// a still-live [`PerPageSuballocator`] handle for some other arena holds.
pub struct PerPageBlockAllocator<const BLOCK_SIZE: usize> {
    arenas: Vec<Option<PerPageArena<BLOCK_SIZE>>>,
    arenas_with_room: Vec<usize>,
}

impl<const BLOCK_SIZE: usize> Default for PerPageBlockAllocator<BLOCK_SIZE> {
    fn default() -> Self {
        Self { arenas: Vec::new(), arenas_with_room: Vec::new() }
    }
}

impl<const BLOCK_SIZE: usize> PerPageBlockAllocator<BLOCK_SIZE> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a free block, creating a new arena if none has room.
    pub fn allocate_block(&mut self) -> Result<PerPageSuballocator<BLOCK_SIZE>> {
        loop {
            if let Some(&arena_idx) = self.arenas_with_room.last() {
                let arena = self.arenas[arena_idx].as_mut().expect("arenas_with_room only references live arenas");
                if let Some(block_idx) = arena.claim_free_block() {
                    if !arena.has_free_block() {
                        self.arenas_with_room.pop();
                    }
                    let ptr = arena.block_ptr(block_idx);
                    return Ok(PerPageSuballocator::new(arena_idx, block_idx, ptr));
                }
                self.arenas_with_room.pop();
                continue;
            }
            let arena = PerPageArena::<BLOCK_SIZE>::new(PER_PAGE_OFFSET)?;
            let arena_idx = if let Some(slot) = self.arenas.iter().position(Option::is_none) {
                self.arenas[slot] = Some(arena);
                slot
            } else {
                self.arenas.push(Some(arena));
                self.arenas.len() - 1
            };
            self.arenas_with_room.push(arena_idx);
        }
    }

    /// Releases a block back to its arena, once its suballocator handle
    /// reports [`PerPageSuballocator::is_empty`]. If that release drains the
    /// whole arena, the arena itself is reclaimed (dropping it unmaps its
    /// region) rather than kept around empty.
    pub fn deallocate_block(&mut self, sub: PerPageSuballocator<BLOCK_SIZE>) {
        let arena = self.arenas[sub.arena_idx].as_mut().expect("arena_idx refers to a live arena");
        let was_full = !arena.has_free_block();
        arena.release_block(sub.block_idx);
        if arena.is_empty() {
            self.arenas[sub.arena_idx] = None;
            if let Some(pos) = self.arenas_with_room.iter().position(|&idx| idx == sub.arena_idx) {
                self.arenas_with_room.swap_remove(pos);
            }
            return;
        }
        if was_full {
            self.arenas_with_room.push(sub.arena_idx);
        }
    }
}
