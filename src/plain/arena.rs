//! One plain-suballocator arena: `MAX_N_PAGES` data pages tracked by an
//! in-process metadata array (spec §4.3), grounded on
//! `plain_suballoc_page_metadata.hpp`'s `PlainSuballocatorPageMetadata` union
//! — reimplemented as a Rust enum rather than a tagged union, and with
//! bookkeeping kept in an ordinary heap `Vec` rather than inline arena pages,
//! since nothing about arena metadata itself is ever relocated or swapped.

use std::ptr::NonNull;
use std::rc::Rc;

use crate::plain::bitmap::SlabBitmap;
use crate::region::AlignedRegion;
use crate::size_class::MAX_N_PAGES;
use crate::store::PagingFacility;

/// Per-data-page bookkeeping. `Free`/`Direct` carry their run length only at
/// the run's head and tail page (boundary tags), letting deallocation merge
/// with either neighbor in O(1).
#[derive(Clone, Copy)]
pub enum PageMetadata {
    /// Free run; valid at both the first and last page of the run.
    Free { n_pages: usize },
    /// Head page of a slab's page run.
    Slab { bitmap: SlabBitmap, class_idx: usize },
    /// Head (and, if `n_pages == 0`, tail-sentinel) page of a page-direct
    /// ("medium") allocation.
    Direct { n_pages: usize },
    /// An interior page of a multi-page slab, pointing back at the page
    /// holding the slab's bitmap — a slab's slots can straddle several
    /// pages, but only the head page carries one.
    SlabCont { head_page_idx: usize },
    /// An interior page of a multi-page direct allocation — carries no
    /// information of its own, since direct allocations are always located
    /// by their (page-aligned) head pointer.
    Used,
}

/// What an arena does with the paging facility at destruction time.
/// Purely-local arenas never touch it; swappable-plain arenas unregister
/// their whole data region.
pub trait ArenaAppendix {
    fn on_destroy(&mut self, region: &AlignedRegion);
}

/// The purely-local subspace's appendix: a no-op.
pub struct NoAppendix;

impl ArenaAppendix for NoAppendix {
    fn on_destroy(&mut self, _region: &AlignedRegion) {}
}

/// The swappable-plain subspace's appendix: unregisters the arena's data
/// region from the paging facility it was registered with at creation.
pub struct PagingAppendix {
    facility: Rc<dyn PagingFacility>,
}

impl ArenaAppendix for PagingAppendix {
    fn on_destroy(&mut self, region: &AlignedRegion) {
        if let Some(ptr) = NonNull::new(region.as_ptr()) {
            self.facility.unregister_region(ptr);
        }
    }
}

/// One arena of a plain suballocator: `MAX_N_PAGES` pages of data, each
/// tracked by a [`PageMetadata`] slot.
pub struct PlainArena<A: ArenaAppendix> {
    region: AlignedRegion,
    pub metadata: Vec<PageMetadata>,
    pub appendix: A,
}

fn fresh_metadata() -> Vec<PageMetadata> {
    let mut metadata = vec![PageMetadata::Used; MAX_N_PAGES];
    metadata[0] = PageMetadata::Free { n_pages: MAX_N_PAGES };
    metadata[MAX_N_PAGES - 1] = PageMetadata::Free { n_pages: MAX_N_PAGES };
    metadata
}

impl PlainArena<NoAppendix> {
    /// Carves a fresh purely-local arena out of the given offset's subspace
    /// slot, with every page free.
    pub fn new(offset: usize) -> crate::error::Result<Self> {
        use crate::params::{ARENA_SIZE, SUBSPACE_INTERVAL};
        let region = AlignedRegion::new(ARENA_SIZE, SUBSPACE_INTERVAL, offset)?;
        Ok(Self { region, metadata: fresh_metadata(), appendix: NoAppendix })
    }
}

impl<A: ArenaAppendix> PlainArena<A> {
    #[must_use]
    pub fn data_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    #[must_use]
    pub fn page_ptr(&self, page_idx: usize) -> *mut u8 {
        unsafe { self.region.as_ptr().add(page_idx * crate::params::PAGE_SIZE) }
    }
}

impl PlainArena<PagingAppendix> {
    /// Swappable-plain arenas register their data region with the paging
    /// facility at construction time, so need a facility handle up front.
    pub fn new_with_facility(offset: usize, facility: Rc<dyn PagingFacility>) -> crate::error::Result<Self> {
        use crate::params::{ARENA_SIZE, SUBSPACE_INTERVAL};
        let region = AlignedRegion::new(ARENA_SIZE, SUBSPACE_INTERVAL, offset)?;
        if let Some(ptr) = NonNull::new(region.as_ptr()) {
            facility.register_region(ptr, region.size());
        }
        Ok(Self { region, metadata: fresh_metadata(), appendix: PagingAppendix { facility } })
    }
}

impl<A: ArenaAppendix> Drop for PlainArena<A> {
    fn drop(&mut self) {
        self.appendix.on_destroy(&self.region);
    }
}
