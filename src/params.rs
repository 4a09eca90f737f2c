//! Address-space partitioning constants (spec §3, §4.6).
//!
//! Every `4 * ArenaSize`-sized interval of virtual memory is divided into
//! four arena-sized slots. The first three are claimed by the three
//! suballocator kinds; the fourth is reserved headroom so that
//! `PerPageOffset + ArenaSize <= SubspaceInterval` with room to spare.

/// The OS page size this allocator is built around.
pub const PAGE_SIZE: usize = 4096;

/// Size of one arena: 256 pages.
pub const ARENA_SIZE: usize = PAGE_SIZE * 256;

/// Byte offset of the purely-local arena within a subspace interval.
pub const PURELY_LOCAL_OFFSET: usize = 0;
/// Byte offset of the swappable-plain arena within a subspace interval.
pub const SWAPPABLE_PLAIN_OFFSET: usize = PURELY_LOCAL_OFFSET + ARENA_SIZE;
/// Byte offset of the per-page arena within a subspace interval.
pub const PER_PAGE_OFFSET: usize = SWAPPABLE_PLAIN_OFFSET + ARENA_SIZE;

/// Size of one subspace interval: four arenas.
pub const SUBSPACE_INTERVAL: usize = ARENA_SIZE * 4;

const _: () = assert!(PER_PAGE_OFFSET + ARENA_SIZE <= SUBSPACE_INTERVAL);
const _: () = assert!(ARENA_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE.is_power_of_two());

/// Mask recovering `(p mod SUBSPACE_INTERVAL) & ~(ARENA_SIZE - 1)` — the
/// allocator's fundamental pointer-to-subspace invariant (spec §3).
#[inline]
#[must_use]
pub fn arena_offset_of(ptr: *const u8) -> usize {
    ((ptr as usize) % SUBSPACE_INTERVAL) & !(ARENA_SIZE - 1)
}

/// Rounds `size` up to the next multiple of `PAGE_SIZE`.
#[inline]
#[must_use]
pub fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_disjoint_and_ordered() {
        assert_eq!(PURELY_LOCAL_OFFSET, 0);
        assert_eq!(SWAPPABLE_PLAIN_OFFSET, ARENA_SIZE);
        assert_eq!(PER_PAGE_OFFSET, 2 * ARENA_SIZE);
        assert_eq!(SUBSPACE_INTERVAL, 4 * ARENA_SIZE);
    }

    #[test]
    fn round_up_to_page_is_idempotent_on_multiples() {
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
        assert_eq!(round_up_to_page(0), 0);
    }
}
