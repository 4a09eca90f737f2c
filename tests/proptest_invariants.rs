//! Property tests for testable invariant 3 (spec §8): after every matched
//! allocate/deallocate pair, whatever the arena-internal bookkeeping looks
//! like, no two live allocations ever alias and every live pointer still
//! belongs to the kind it was allocated from.

use proptest::prelude::*;

use farmalloc::params::ARENA_SIZE;
use farmalloc::{CollectiveAllocator, SuballocatorKind};

#[derive(Debug, Clone, Copy)]
enum Op {
    Allocate { size: usize },
    DeallocateMostRecent,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..=512).prop_map(|size| Op::Allocate { size }),
        1 => Just(Op::DeallocateMostRecent),
    ]
}

proptest! {
    /// A random interleaving of small allocations and most-recent-first
    /// deallocations never aliases two live objects and always lands each
    /// pointer in the subspace its kind claims.
    #[test]
    fn no_aliasing_across_random_alloc_dealloc_sequences(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let engine = CollectiveAllocator::<4096>::new(16 * ARENA_SIZE);
        let swap = engine.get_suballocator(SuballocatorKind::SwappablePlain);

        let mut live: Vec<(std::ptr::NonNull<u8>, usize)> = Vec::new();
        for op in ops {
            match op {
                Op::Allocate { size } => {
                    let ptr = swap.allocate(size).unwrap();
                    prop_assert!(swap.contains(ptr.as_ptr()));
                    prop_assert_eq!(SuballocatorKind::of_ptr(ptr.as_ptr()), SuballocatorKind::SwappablePlain);
                    for &(other, other_size) in &live {
                        let (a, b) = (ptr.as_ptr() as usize, other.as_ptr() as usize);
                        let disjoint = a >= b + other_size || b >= a + size;
                        prop_assert!(disjoint, "new allocation aliases a live one");
                    }
                    live.push((ptr, size));
                }
                Op::DeallocateMostRecent => {
                    if let Some((ptr, size)) = live.pop() {
                        swap.deallocate(ptr, size);
                    }
                }
            }
        }

        for (ptr, size) in live {
            swap.deallocate(ptr, size);
        }
    }
}
