//! The hint allocator (spec §4.5), grounded on `hint_allocator.hpp`'s
//! `HintAllocatorImpl`: a dedicated pool of fixed-size blocks, each run by
//! the same K&R free list as the per-page suballocator ([`crate::kr`]), with
//! an `allocate_with_hint` entry point that tries to place a new object in
//! the same block as a caller-supplied nearby pointer first — e.g. so a
//! skip list's nodes stay clustered instead of scattering across blocks.
//!
//! Unlike [`crate::perpage`], a block's free-list state here is persisted in
//! the arena (not handed out as an exclusive consumer-owned handle), because
//! `deallocate` must be able to locate any live object's block from its
//! pointer alone — there is no caller-held handle to consult.
//!
//! The real `HintAllocator<T, BlockSize>` is a `std::allocator`-shaped type
//! usable with STL containers; Rust's equivalent `Allocator` trait is
//! unstable, so [`HintAllocator`] exposes the same `allocate`/
//! `allocate_with_hint`/`deallocate` operations as plain methods instead of
//! implementing that trait (see `DESIGN.md`).

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::Result;
use crate::kr::{unit_size, FreeHeader, KrFreeList, NarrowIndex};
use crate::params::{ARENA_SIZE, PER_PAGE_OFFSET, SUBSPACE_INTERVAL};
use crate::region::AlignedRegion;
use crate::size_class::MAX_N_PAGES;

type Idx = u32;

struct BlockMeta {
    freep: Idx,
    usage: usize,
}

struct HintArena<const BLOCK_SIZE: usize> {
    region: AlignedRegion,
    blocks: Vec<BlockMeta>,
    /// Count of blocks with `usage > 0`; the arena as a whole is empty (spec
    /// §4.5's `num_of_used_blocks == 0`) once this reaches zero.
    n_nonempty_blocks: usize,
}

impl<const BLOCK_SIZE: usize> HintArena<BLOCK_SIZE> {
    const N_BLOCKS: usize = (MAX_N_PAGES * crate::params::PAGE_SIZE) / BLOCK_SIZE;

    fn new() -> Result<Self> {
        let region = AlignedRegion::new(ARENA_SIZE, SUBSPACE_INTERVAL, PER_PAGE_OFFSET)?;
        let blocks = (0..Self::N_BLOCKS).map(|_| BlockMeta { freep: Idx::NIL, usage: 0 }).collect();
        Ok(Self { region, blocks, n_nonempty_blocks: 0 })
    }

    /// Whether every block in this arena currently holds no live allocation.
    fn is_empty(&self) -> bool {
        self.n_nonempty_blocks == 0
    }

    fn block_ptr(&self, idx: usize) -> *mut FreeHeader<Idx> {
        unsafe { self.region.as_ptr().add(idx * BLOCK_SIZE).cast() }
    }

    fn locate(&self, ptr: *const u8) -> Option<usize> {
        let base = self.region.as_ptr() as usize;
        let addr = ptr as usize;
        let limit = Self::N_BLOCKS * BLOCK_SIZE;
        if addr >= base && addr < base + limit {
            Some((addr - base) / BLOCK_SIZE)
        } else {
            None
        }
    }

    fn n_units() -> usize {
        BLOCK_SIZE / unit_size::<Idx>()
    }

    /// Tries to allocate `n_units` from block `block_idx`, seeding it as one
    /// whole free run first if it has never been used.
    fn try_allocate_in(&mut self, block_idx: usize, n_units: usize) -> Option<NonNull<u8>> {
        let ptr = self.block_ptr(block_idx);
        let meta = &mut self.blocks[block_idx];
        let mut list = unsafe { KrFreeList::<Idx>::reopen(ptr, Self::n_units(), meta.freep) };
        if meta.usage == 0 && meta.freep == Idx::NIL {
            list.free_run(0, Self::n_units());
        }
        let idx = list.alloc_run(n_units)?;
        meta.freep = list.freep();
        if meta.usage == 0 {
            self.n_nonempty_blocks += 1;
        }
        meta.usage += n_units;
        let unit = unit_size::<Idx>();
        NonNull::new(unsafe { (ptr as *mut u8).add(idx * unit) })
    }

    fn deallocate_in(&mut self, block_idx: usize, ptr: NonNull<u8>, n_units: usize) {
        let base = self.block_ptr(block_idx);
        let unit = unit_size::<Idx>();
        let idx = (ptr.as_ptr() as usize - base as usize) / unit;
        let meta = &mut self.blocks[block_idx];
        let mut list = unsafe { KrFreeList::<Idx>::reopen(base, Self::n_units(), meta.freep) };
        list.free_run(idx, n_units);
        meta.freep = list.freep();
        meta.usage -= n_units;
        if meta.usage == 0 {
            self.n_nonempty_blocks -= 1;
        }
    }

    fn is_block_full(&self, block_idx: usize) -> bool {
        self.blocks[block_idx].usage >= Self::n_units()
    }
}

struct HintAllocatorImpl<const BLOCK_SIZE: usize> {
    /// `None` slots are arenas that were fully drained and reclaimed; a
    /// future arena can reuse the slot index instead of growing the vector,
    /// so no live `current`/caller pointer into another arena is disturbed.
    arenas: Vec<Option<HintArena<BLOCK_SIZE>>>,
    current: Option<(usize, usize)>,
}

impl<const BLOCK_SIZE: usize> HintAllocatorImpl<BLOCK_SIZE> {
    fn new() -> Self {
        Self { arenas: Vec::new(), current: None }
    }

    fn n_units_for(size: usize) -> usize {
        let unit = unit_size::<Idx>();
        size.div_ceil(unit)
    }

    fn push_arena(&mut self, arena: HintArena<BLOCK_SIZE>) -> usize {
        if let Some(slot) = self.arenas.iter().position(Option::is_none) {
            self.arenas[slot] = Some(arena);
            slot
        } else {
            self.arenas.push(Some(arena));
            self.arenas.len() - 1
        }
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let n_units = Self::n_units_for(size);

        if let Some((arena_idx, block_idx)) = self.current {
            match self.arenas[arena_idx].as_mut() {
                Some(arena) if !arena.is_block_full(block_idx) => {
                    if let Some(ptr) = arena.try_allocate_in(block_idx, n_units) {
                        return Ok(ptr);
                    }
                }
                Some(_) => {}
                None => self.current = None,
            }
        }

        for (arena_idx, slot) in self.arenas.iter_mut().enumerate() {
            let Some(arena) = slot else { continue };
            for block_idx in 0..HintArena::<BLOCK_SIZE>::N_BLOCKS {
                if !arena.is_block_full(block_idx) {
                    if let Some(ptr) = arena.try_allocate_in(block_idx, n_units) {
                        self.current = Some((arena_idx, block_idx));
                        return Ok(ptr);
                    }
                }
            }
        }

        let arena_idx = self.push_arena(HintArena::<BLOCK_SIZE>::new()?);
        let ptr = self.arenas[arena_idx]
            .as_mut()
            .expect("just inserted")
            .try_allocate_in(0, n_units)
            .expect("a fresh block always has room for its first allocation");
        self.current = Some((arena_idx, 0));
        Ok(ptr)
    }

    fn allocate_with_hint(&mut self, size: usize, hint: NonNull<u8>) -> Result<NonNull<u8>> {
        let n_units = Self::n_units_for(size);
        for (arena_idx, slot) in self.arenas.iter_mut().enumerate() {
            let Some(arena) = slot else { continue };
            if let Some(block_idx) = arena.locate(hint.as_ptr()) {
                if let Some(ptr) = arena.try_allocate_in(block_idx, n_units) {
                    self.current = Some((arena_idx, block_idx));
                    return Ok(ptr);
                }
                break;
            }
        }
        self.allocate(size)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let n_units = Self::n_units_for(size);
        for (arena_idx, slot) in self.arenas.iter_mut().enumerate() {
            let Some(arena) = slot else { continue };
            if let Some(block_idx) = arena.locate(ptr.as_ptr()) {
                arena.deallocate_in(block_idx, ptr, n_units);
                if arena.is_empty() {
                    // Whole arena drained: reclaim it (its `Drop` unmaps the
                    // region) rather than keep empty backing memory mapped.
                    *slot = None;
                    if matches!(self.current, Some((cur, _)) if cur == arena_idx) {
                        self.current = None;
                    }
                }
                return;
            }
        }
        unreachable!("pointer does not belong to any hint-allocator arena");
    }
}

/// A cheap, cloneable handle to a pool of `BLOCK_SIZE`-sized blocks, each
/// internally managed by a K&R free list.
pub struct HintAllocator<const BLOCK_SIZE: usize> {
    inner: Rc<RefCell<HintAllocatorImpl<BLOCK_SIZE>>>,
}

impl<const BLOCK_SIZE: usize> Clone for HintAllocator<BLOCK_SIZE> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<const BLOCK_SIZE: usize> Default for HintAllocator<BLOCK_SIZE> {
    fn default() -> Self {
        Self { inner: Rc::new(RefCell::new(HintAllocatorImpl::new())) }
    }
}

impl<const BLOCK_SIZE: usize> HintAllocator<BLOCK_SIZE> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates `size` bytes with no locality preference.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.inner.borrow_mut().allocate(size)
    }

    /// Allocates `size` bytes, preferring the block that contains `hint` if
    /// it has room.
    pub fn allocate_with_hint(&self, size: usize, hint: NonNull<u8>) -> Result<NonNull<u8>> {
        self.inner.borrow_mut().allocate_with_hint(size, hint)
    }

    /// Deallocates a pointer previously returned by this allocator.
    pub fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.inner.borrow_mut().deallocate(ptr, size);
    }
}
