//! The client-facing traits protocol (spec §4.7), grounded on
//! `collective_allocator_traits.hpp`: requests that describe how many
//! elements of what size a client wants, an all-or-nothing batch allocator,
//! and a relocate operation that moves a batch of live objects to a
//! different suballocator and deallocates the originals only once every
//! replacement has landed.
//!
//! `request::{constant<T,N>, dynamic<T>, null<T>}` become plain [`Request`]
//! variants; `batch_allocate_helper`'s variadic fold over heterogeneous
//! request packs becomes a fold over a `&[Request]` slice, since Rust has no
//! template-parameter-pack equivalent to dispatch on at compile time here.
//! `default_relocate`'s `uninitialized_move_n`/`destroy_n` becomes a raw byte
//! copy, since this layer has no type information to move-construct with —
//! callers needing typed move semantics supply their own `relocate_with`.

use std::ptr::NonNull;

use super::Suballocator;

/// One allocation request within a batch.
#[derive(Debug, Clone, Copy)]
pub enum Request {
    /// `n` elements of `elem_size` bytes each, allocated as one contiguous
    /// block (`request::constant<T, N>` / `request::dynamic<T>`).
    Elements { elem_size: usize, n: usize },
    /// A placeholder that consumes no allocation and always succeeds with no
    /// pointer (`request::null<T>`).
    Null,
}

impl Request {
    #[must_use]
    pub fn single(elem_size: usize) -> Self {
        Request::Elements { elem_size, n: 1 }
    }

    fn total_size(self) -> Option<usize> {
        match self {
            Request::Elements { elem_size, n } => Some(elem_size * n),
            Request::Null => None,
        }
    }
}

/// Allocates every non-[`Request::Null`] request in `requests` from
/// `suballoc`, or none of them: if any request fails, every allocation made
/// so far in this batch is rolled back before returning `None`.
pub fn batch_allocate<const BLOCK_SIZE: usize>(
    suballoc: &Suballocator<BLOCK_SIZE>,
    requests: &[Request],
) -> Option<Vec<Option<NonNull<u8>>>> {
    let mut allocated = Vec::with_capacity(requests.len());
    for &request in requests {
        let Some(size) = request.total_size() else {
            allocated.push(None);
            continue;
        };
        match suballoc.allocate(size) {
            Ok(ptr) => allocated.push(Some(ptr)),
            Err(_) => {
                for (req, ptr) in requests.iter().zip(allocated.iter()) {
                    if let (Some(size), Some(ptr)) = (req.total_size(), ptr) {
                        suballoc.deallocate(*ptr, size);
                    }
                }
                return None;
            }
        }
    }
    Some(allocated)
}

/// Moves every live allocation in `items` from `from` to `to`, byte-for-byte.
///
/// Allocates the full replacement batch in `to` first (via [`batch_allocate`],
/// so it is all-or-nothing), copies each object's bytes over, then
/// deallocates the originals from `from`. If the batch allocation in `to`
/// fails, `items` is left completely untouched and `None` is returned.
/// Mirrors `collective_allocator_traits.hpp`'s `relocate`/`default_relocate`.
pub fn relocate<const BLOCK_SIZE: usize>(
    from: &Suballocator<BLOCK_SIZE>,
    to: &Suballocator<BLOCK_SIZE>,
    items: &[(NonNull<u8>, usize)],
) -> Option<Vec<NonNull<u8>>> {
    let requests: Vec<Request> = items.iter().map(|&(_, size)| Request::Elements { elem_size: size, n: 1 }).collect();
    let new_ptrs = batch_allocate(to, &requests)?;

    let mut result = Vec::with_capacity(items.len());
    for (&(old_ptr, size), new_ptr) in items.iter().zip(new_ptrs.iter()) {
        let new_ptr = new_ptr.expect("relocate never issues Null requests");
        // SAFETY: `old_ptr` is valid for `size` bytes per the caller's
        // contract; `new_ptr` was just allocated for exactly `size` bytes and
        // does not overlap it (distinct suballocators/subspaces).
        unsafe {
            std::ptr::copy_nonoverlapping(old_ptr.as_ptr(), new_ptr.as_ptr(), size);
        }
        result.push(new_ptr);
    }
    for &(old_ptr, size) in items {
        from.deallocate(old_ptr, size);
    }
    Some(result)
}
