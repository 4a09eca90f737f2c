//! The plain suballocator (spec §4.3): a slab allocator for small objects, a
//! free-page-run allocator for medium ones, and direct region allocation for
//! large ones, parameterized by an arena [`ArenaAppendix`] and a suballocator-
//! wide [`PlainCustom`] policy.
//!
//! Grounded on `plain_suballoc.hpp`'s `PlainSuballocatorImplBase`. The
//! original threads one intrusive linked list per size class through nodes
//! embedded across arenas; we keep the same free-list-per-class structure
//! but as a `Vec`-backed stack per class, which is simpler and behaves
//! identically for this crate's purposes (arena counts stay small enough
//! that the O(n) list-removal on free is not a concern).

pub mod arena;
pub mod bitmap;
pub mod custom;

use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::Result;
use crate::params::{round_up_to_page, ARENA_SIZE, PAGE_SIZE, SUBSPACE_INTERVAL};
use crate::size_class::{
    alloc_class_idx2n_pages, alloc_class_idx2n_slots, alloc_class_idx2size, alloc_size2class_idx, page_class_idx2size,
    page_free_size2class_idx, MAX_N_PAGES, MAX_SMALL_ALLOC_SIZE, N_ALLOC_CLASSES,
};
use crate::store::PagingFacility;

use arena::{ArenaAppendix, NoAppendix, PageMetadata, PagingAppendix, PlainArena};
use bitmap::SlabBitmap;
use custom::{PlainCustom, PurelyLocalCustom, SwappablePlainCustom};

/// Number of page-free-run classes a plain arena's data pages fall into.
const N_PAGE_CLASSES: usize = page_free_size2class_idx(MAX_N_PAGES * PAGE_SIZE) + 1;

/// Largest size the page-direct ("medium") path services before an
/// allocation must go direct to the OS instead: one page short of the
/// largest power-of-two page count that fits in the page-class table's top
/// class (`plain_suballoc.hpp`'s `MaxMediumAllocSize`). A request past this
/// goes straight to `allocate_large`.
pub const MAX_MEDIUM_ALLOC_SIZE: usize = {
    let top_class_pages = page_class_idx2size(N_PAGE_CLASSES - 1) / PAGE_SIZE;
    let bit_floor_pages = 1usize << top_class_pages.ilog2();
    (bit_floor_pages - 1) * PAGE_SIZE
};

struct SlabSite {
    arena_idx: usize,
    page_idx: usize,
}

/// A slab/page/large-object allocator over a growable list of same-kind
/// arenas.
///
/// `None` slots are arenas destroyed once their data area became a single
/// free run spanning the whole arena (spec §4.3); a later arena reuses the
/// slot index instead of growing the vector, so reclaiming one arena never
/// disturbs another arena's index, which `current_slab`/`non_full_slabs`/
/// `free_pages` entries may still reference.
pub struct PlainSuballocator<A: ArenaAppendix, C> {
    offset: usize,
    arenas: Vec<Option<PlainArena<A>>>,
    current_slab: [Option<SlabSite>; N_ALLOC_CLASSES],
    non_full_slabs: [Vec<SlabSite>; N_ALLOC_CLASSES],
    free_pages: [Vec<(usize, usize)>; N_PAGE_CLASSES],
    custom: C,
}

impl<A: ArenaAppendix, C: PlainCustom> PlainSuballocator<A, C> {
    fn with_custom(offset: usize, custom: C) -> Self {
        Self {
            offset,
            arenas: Vec::new(),
            current_slab: std::array::from_fn(|_| None),
            non_full_slabs: std::array::from_fn(|_| Vec::new()),
            free_pages: std::array::from_fn(|_| Vec::new()),
            custom,
        }
    }

    fn arena_mut(&mut self, arena_idx: usize) -> &mut PlainArena<A> {
        self.arenas[arena_idx].as_mut().expect("arena_idx refers to a live arena")
    }

    /// Allocates `size` bytes, dispatching to the slab, page, or large path.
    pub fn allocate(&mut self, size: usize, new_arena: impl Fn(usize) -> Result<PlainArena<A>>) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, 1, new_arena)
    }

    /// As [`Self::allocate`], but for the one case the small-object path
    /// supports alignment greater than a page: a single element with
    /// `size == align == 2 * PageSize`. Any other request with `align` above
    /// a page is a caller bug.
    pub fn allocate_aligned(&mut self, size: usize, align: usize, new_arena: impl Fn(usize) -> Result<PlainArena<A>>) -> Result<NonNull<u8>> {
        self.custom.check_capacity(size)?;
        let ptr = if size <= MAX_SMALL_ALLOC_SIZE {
            assert!(align <= PAGE_SIZE || (align == 2 * PAGE_SIZE && size == align), "unsupported small-object alignment");
            self.allocate_slab(size, align, new_arena)?
        } else if size <= MAX_MEDIUM_ALLOC_SIZE {
            let n_pages = round_up_to_page(size) / PAGE_SIZE;
            let (arena_idx, page_idx) = self.allocate_page_run(n_pages, new_arena)?;
            self.arena_mut(arena_idx).metadata[page_idx] = PageMetadata::Direct { n_pages };
            for p in page_idx + 1..page_idx + n_pages {
                self.arena_mut(arena_idx).metadata[p] = PageMetadata::Used;
            }
            NonNull::new(self.arena_mut(arena_idx).page_ptr(page_idx)).expect("page_ptr is never null")
        } else {
            let ptr = self.allocate_large(size)?;
            self.custom.consume_capacity(size);
            return Ok(ptr);
        };
        self.custom.consume_capacity(size);
        Ok(ptr)
    }

    /// Deallocates a pointer previously returned by [`Self::allocate`].
    pub fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        if size > MAX_MEDIUM_ALLOC_SIZE {
            self.deallocate_large(ptr, size);
            self.custom.reclaim_capacity(size);
            return;
        }
        let (arena_idx, page_idx, offset_in_page) = self.locate(ptr);
        if size <= MAX_SMALL_ALLOC_SIZE {
            self.deallocate_slab(arena_idx, page_idx, offset_in_page, size);
        } else {
            let n_pages = round_up_to_page(size) / PAGE_SIZE;
            self.free_page_run(arena_idx, page_idx, n_pages);
        }
        self.custom.reclaim_capacity(size);
    }

    /// Fraction of consumed capacity relative to this policy's ceiling.
    #[must_use]
    pub fn is_occupancy_under(&self, threshold: f64) -> bool {
        self.custom.is_occupancy_under(threshold)
    }

    fn locate(&self, ptr: NonNull<u8>) -> (usize, usize, usize) {
        let addr = ptr.as_ptr() as usize;
        for (arena_idx, slot) in self.arenas.iter().enumerate() {
            let Some(arena) = slot else { continue };
            let base = arena.data_ptr() as usize;
            if addr >= base && addr < base + MAX_N_PAGES * PAGE_SIZE {
                let rel = addr - base;
                return (arena_idx, rel / PAGE_SIZE, rel % PAGE_SIZE);
            }
        }
        unreachable!("pointer does not belong to any arena of this suballocator")
    }

    fn allocate_slab(&mut self, size: usize, align: usize, new_arena: impl Fn(usize) -> Result<PlainArena<A>>) -> Result<NonNull<u8>> {
        let class_idx = alloc_size2class_idx(size);
        let elem_size = alloc_class_idx2size(class_idx);
        let n_slots = alloc_class_idx2n_slots(class_idx);
        let needs_even_page = align > PAGE_SIZE;

        if self.current_slab[class_idx].is_none() {
            if let Some(site) = self.non_full_slabs[class_idx].pop() {
                self.current_slab[class_idx] = Some(site);
            } else {
                let n_pages = alloc_class_idx2n_pages(class_idx);
                loop {
                    let (arena_idx, page_idx) = self.allocate_page_run(n_pages, &new_arena)?;
                    // The rollback branch (spec §9 OQ1): a fresh slab for an
                    // Align == ElemSize == 2*PageSize request must land on an
                    // even page index; release and retry otherwise.
                    if needs_even_page && page_idx % 2 != 0 {
                        self.free_page_run(arena_idx, page_idx, n_pages);
                        continue;
                    }
                    self.arena_mut(arena_idx).metadata[page_idx] = PageMetadata::Slab {
                        bitmap: SlabBitmap::empty(),
                        class_idx,
                    };
                    for p in page_idx + 1..page_idx + n_pages {
                        self.arena_mut(arena_idx).metadata[p] = PageMetadata::SlabCont { head_page_idx: page_idx };
                    }
                    self.current_slab[class_idx] = Some(SlabSite { arena_idx, page_idx });
                    break;
                }
            }
        }

        let site = self.current_slab[class_idx].as_ref().expect("just ensured Some");
        let (arena_idx, page_idx) = (site.arena_idx, site.page_idx);
        let PageMetadata::Slab { bitmap, .. } = &mut self.arena_mut(arena_idx).metadata[page_idx] else {
            unreachable!("current_slab always points at a Slab page")
        };
        let slot = bitmap.find_unset_and_set(n_slots).expect("current_slab is never left full");
        if bitmap.is_full(n_slots) {
            self.current_slab[class_idx] = None;
        }

        let ptr = unsafe { self.arena_mut(arena_idx).page_ptr(page_idx).add(slot * elem_size) };
        Ok(NonNull::new(ptr).expect("slab slot pointer is never null"))
    }

    fn deallocate_slab(&mut self, arena_idx: usize, page_idx: usize, offset_in_page: usize, size: usize) {
        let class_idx = alloc_size2class_idx(size);
        let elem_size = alloc_class_idx2size(class_idx);
        let n_slots = alloc_class_idx2n_slots(class_idx);

        // A slab's slots can straddle several pages, but only the head page
        // carries the bitmap; resolve any continuation page back to it.
        let (page_idx, byte_offset) = match self.arena_mut(arena_idx).metadata[page_idx] {
            PageMetadata::SlabCont { head_page_idx } => (head_page_idx, (page_idx - head_page_idx) * PAGE_SIZE + offset_in_page),
            _ => (page_idx, offset_in_page),
        };
        let slot = byte_offset / elem_size;

        let was_full;
        let now_empty;
        {
            let PageMetadata::Slab { bitmap, .. } = &mut self.arena_mut(arena_idx).metadata[page_idx] else {
                unreachable!("deallocating a slab slot of a non-slab page")
            };
            was_full = bitmap.is_full(n_slots);
            bitmap.flip(slot);
            now_empty = bitmap.is_empty();
        }
        if now_empty {
            // The page this slab lived on is about to be handed back to the
            // free-page-run machinery, possibly for an entirely different
            // size class; any reference to it as this class's current or
            // non-full slab must go with it.
            let is_current = matches!(&self.current_slab[class_idx], Some(s) if s.arena_idx == arena_idx && s.page_idx == page_idx);
            if is_current {
                self.current_slab[class_idx] = None;
            } else {
                self.non_full_slabs[class_idx].retain(|s| !(s.arena_idx == arena_idx && s.page_idx == page_idx));
            }
            let n_pages = alloc_class_idx2n_pages(class_idx);
            self.free_page_run(arena_idx, page_idx, n_pages);
            return;
        }
        if was_full {
            self.non_full_slabs[class_idx].push(SlabSite { arena_idx, page_idx });
        }
    }

    fn allocate_page_run(&mut self, n_pages: usize, new_arena: impl Fn(usize) -> Result<PlainArena<A>>) -> Result<(usize, usize)> {
        let wanted_class = page_free_size2class_idx(round_up_to_page(n_pages * PAGE_SIZE).max(PAGE_SIZE));
        for class in wanted_class..N_PAGE_CLASSES {
            // A page-free class bucket spans a range of run lengths, so a
            // run in this bucket can still be individually too small for
            // this request; set those aside and restore them once we're
            // done scanning the bucket, rather than looping on them.
            let mut too_small = Vec::new();
            let found = loop {
                let Some((arena_idx, page_idx)) = self.free_pages[class].pop() else {
                    break None;
                };
                let PageMetadata::Free { n_pages: run_len } = self.arena_mut(arena_idx).metadata[page_idx] else {
                    unreachable!("free_pages only ever holds Free run heads")
                };
                if run_len < n_pages {
                    too_small.push((arena_idx, page_idx));
                    continue;
                }
                break Some((arena_idx, page_idx, run_len));
            };
            self.free_pages[class].extend(too_small);
            if let Some((arena_idx, page_idx, run_len)) = found {
                if run_len > n_pages {
                    let rest_idx = page_idx + n_pages;
                    let rest_len = run_len - n_pages;
                    self.arena_mut(arena_idx).metadata[rest_idx] = PageMetadata::Free { n_pages: rest_len };
                    self.arena_mut(arena_idx).metadata[rest_idx + rest_len - 1] = PageMetadata::Free { n_pages: rest_len };
                    let rest_class = page_free_size2class_idx(round_up_to_page(rest_len * PAGE_SIZE).max(PAGE_SIZE));
                    self.free_pages[rest_class].push((arena_idx, rest_idx));
                }
                return Ok((arena_idx, page_idx));
            }
        }

        let arena = new_arena(self.offset)?;
        let arena_idx = if let Some(slot) = self.arenas.iter().position(Option::is_none) {
            self.arenas[slot] = Some(arena);
            slot
        } else {
            self.arenas.push(Some(arena));
            self.arenas.len() - 1
        };
        if n_pages < MAX_N_PAGES {
            let rest_idx = n_pages;
            let rest_len = MAX_N_PAGES - n_pages;
            self.arena_mut(arena_idx).metadata[rest_idx] = PageMetadata::Free { n_pages: rest_len };
            self.arena_mut(arena_idx).metadata[rest_idx + rest_len - 1] = PageMetadata::Free { n_pages: rest_len };
            let rest_class = page_free_size2class_idx(round_up_to_page(rest_len * PAGE_SIZE).max(PAGE_SIZE));
            self.free_pages[rest_class].push((arena_idx, rest_idx));
        }
        Ok((arena_idx, 0))
    }

    fn free_page_run(&mut self, arena_idx: usize, mut page_idx: usize, mut n_pages: usize) {
        if page_idx > 0 {
            if let PageMetadata::Free { n_pages: left_len } = self.arena_mut(arena_idx).metadata[page_idx - 1] {
                let left_start = page_idx - left_len;
                self.remove_free_entry(arena_idx, left_start, left_len);
                page_idx = left_start;
                n_pages += left_len;
            }
        }
        if page_idx + n_pages < MAX_N_PAGES {
            if let PageMetadata::Free { n_pages: right_len } = self.arena_mut(arena_idx).metadata[page_idx + n_pages] {
                self.remove_free_entry(arena_idx, page_idx + n_pages, right_len);
                n_pages += right_len;
            }
        }
        if page_idx == 0 && n_pages == MAX_N_PAGES {
            // The whole data area is now a single free run: the arena is
            // destroyed rather than kept around with nothing allocated in
            // it (spec §4.3). Its `Drop` unmaps the backing region and, for
            // the swappable-plain subspace, unregisters it from the paging
            // facility.
            self.arenas[arena_idx] = None;
            return;
        }
        self.arena_mut(arena_idx).metadata[page_idx] = PageMetadata::Free { n_pages };
        self.arena_mut(arena_idx).metadata[page_idx + n_pages - 1] = PageMetadata::Free { n_pages };
        let class = page_free_size2class_idx(round_up_to_page(n_pages * PAGE_SIZE).max(PAGE_SIZE));
        self.free_pages[class].push((arena_idx, page_idx));
    }

    fn remove_free_entry(&mut self, arena_idx: usize, page_idx: usize, n_pages: usize) {
        let class = page_free_size2class_idx(round_up_to_page(n_pages * PAGE_SIZE).max(PAGE_SIZE));
        if let Some(pos) = self.free_pages[class].iter().position(|&e| e == (arena_idx, page_idx)) {
            self.free_pages[class].swap_remove(pos);
        }
    }

    fn allocate_large(&mut self, size: usize) -> Result<NonNull<u8>> {
        let size = self.custom.large_alloc_size(size);
        let rounded = round_up_to_page(size);
        let n_intervals = rounded.div_ceil(ARENA_SIZE);
        let region_size = n_intervals * SUBSPACE_INTERVAL;
        let region = crate::region::AlignedRegion::new(region_size, SUBSPACE_INTERVAL, self.offset)?;
        let ptr = region.as_ptr();
        std::mem::forget(region);
        let ptr = NonNull::new(ptr).expect("large region pointer is never null");
        self.custom.postprocess_large_alloc(ptr, region_size);
        Ok(ptr)
    }

    fn deallocate_large(&mut self, ptr: NonNull<u8>, size: usize) {
        self.custom.preprocess_large_dealloc(ptr, size);
        let rounded = round_up_to_page(size);
        let n_intervals = rounded.div_ceil(ARENA_SIZE);
        let region_size = n_intervals * SUBSPACE_INTERVAL;
        unsafe {
            if libc_munmap(ptr.as_ptr(), region_size) != 0 {
                panic!("munmap of an owned large allocation should not fail");
            }
        }
    }
}

#[cfg(unix)]
unsafe fn libc_munmap(ptr: *mut u8, size: usize) -> i32 {
    libc::munmap(ptr.cast(), size)
}

#[cfg(windows)]
unsafe fn libc_munmap(ptr: *mut u8, _size: usize) -> i32 {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    i32::from(VirtualFree(ptr.cast(), 0, MEM_RELEASE) == 0)
}

/// The purely-local suballocator: a capacity-limited [`PlainSuballocator`]
/// whose arenas never touch the paging facility.
pub type PurelyLocalSuballocator = PlainSuballocator<NoAppendix, PurelyLocalCustom>;

impl PurelyLocalSuballocator {
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self::with_custom(crate::params::PURELY_LOCAL_OFFSET, PurelyLocalCustom::new(capacity_bytes))
    }

    pub fn allocate_local(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate(size, PlainArena::<NoAppendix>::new)
    }

    /// As [`Self::allocate_local`], with an explicit small-object alignment
    /// (spec §4.3's `Align == ElemSize == 2*PageSize` special case).
    pub fn allocate_local_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, align, PlainArena::<NoAppendix>::new)
    }
}

/// The swappable-plain suballocator: an uncapped [`PlainSuballocator`] whose
/// arenas are registered with a [`PagingFacility`].
pub type SwappablePlainSuballocator = PlainSuballocator<PagingAppendix, SwappablePlainCustom>;

impl SwappablePlainSuballocator {
    #[must_use]
    pub fn new(facility: Rc<dyn PagingFacility>) -> Self {
        Self::with_custom(crate::params::SWAPPABLE_PLAIN_OFFSET, SwappablePlainCustom::new(facility))
    }

    pub fn allocate_swappable(&mut self, size: usize, facility: Rc<dyn PagingFacility>) -> Result<NonNull<u8>> {
        self.allocate(size, move |offset| PlainArena::new_with_facility(offset, Rc::clone(&facility)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FarMallocError;

    #[test]
    fn small_allocations_round_trip() {
        let mut sa = PurelyLocalSuballocator::new(64 * ARENA_SIZE);
        let mut ptrs = Vec::new();
        for _ in 0..100 {
            ptrs.push(sa.allocate_local(32).unwrap());
        }
        for p in ptrs {
            sa.deallocate(p, 32);
        }
    }

    #[test]
    fn medium_allocations_round_trip_and_coalesce() {
        let mut sa = PurelyLocalSuballocator::new(64 * ARENA_SIZE);
        let a = sa.allocate_local(10 * PAGE_SIZE).unwrap();
        let b = sa.allocate_local(10 * PAGE_SIZE).unwrap();
        sa.deallocate(a, 10 * PAGE_SIZE);
        sa.deallocate(b, 10 * PAGE_SIZE);
        // The coalesced run should be able to service a request spanning
        // both former allocations.
        let c = sa.allocate_local(20 * PAGE_SIZE).unwrap();
        sa.deallocate(c, 20 * PAGE_SIZE);
    }

    #[test]
    fn capacity_ceiling_is_enforced() {
        let mut sa = PurelyLocalSuballocator::new(ARENA_SIZE);
        let mut count = 0;
        loop {
            match sa.allocate_local(4096) {
                Ok(_) => count += 1,
                Err(FarMallocError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert!(count <= MAX_N_PAGES + 1, "ceiling should have kicked in by now");
        }
    }

    #[test]
    fn large_allocation_round_trips() {
        let mut sa = PurelyLocalSuballocator::new(8 * ARENA_SIZE);
        let ptr = sa.allocate_local(MAX_MEDIUM_ALLOC_SIZE + 1).unwrap();
        assert_eq!(ptr.as_ptr() as usize % SUBSPACE_INTERVAL, sa.offset);
        sa.deallocate(ptr, MAX_MEDIUM_ALLOC_SIZE + 1);
    }

    #[test]
    fn two_page_aligned_slab_lands_on_an_even_page() {
        let mut sa = PurelyLocalSuballocator::new(8 * ARENA_SIZE);
        let elem_size = 2 * PAGE_SIZE;
        let ptr = sa.allocate_local_aligned(elem_size, elem_size).unwrap();
        let (_, page_idx, offset_in_page) = sa.locate(ptr);
        assert_eq!(offset_in_page, 0);
        assert_eq!(page_idx % 2, 0);
        sa.deallocate(ptr, elem_size);
    }
}
