//! Aligned region allocation (spec §4.1).
//!
//! Arenas must sit at addresses aligned to `ArenaSize` with a fixed `Offset`
//! inside a `SubspaceInterval`, so that [`crate::params::arena_offset_of`] can
//! recover which suballocator kind owns a pointer from its high bits alone.
//! We get there the same way the C++ original does: over-reserve, then trim
//! the unaligned head and tail back to the OS.

use std::io;
use std::ptr::NonNull;

use crate::error::{FarMallocError, Result};
use crate::params::PAGE_SIZE;

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr;

    pub unsafe fn reserve(size: usize) -> io::Result<*mut u8> {
        let ptr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr.cast())
        }
    }

    pub unsafe fn release(ptr: *mut u8, size: usize) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }
        if libc::munmap(ptr.cast(), size) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::io;
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };

    pub unsafe fn reserve(size: usize) -> io::Result<*mut u8> {
        let ptr = VirtualAlloc(ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr.cast())
        }
    }

    /// Windows only supports releasing an entire `VirtualAlloc` reservation
    /// at once, so we cannot trim a partial region like the Unix path does.
    /// `AlignedRegion` on Windows therefore keeps the untrimmed base around
    /// and only ever frees the whole thing.
    pub unsafe fn release(ptr: *mut u8, _size: usize) -> io::Result<()> {
        if VirtualFree(ptr.cast(), 0, MEM_RELEASE) == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn from_os_error(e: io::Error) -> FarMallocError {
    if e.raw_os_error() == Some(libc_enomem()) {
        FarMallocError::OutOfMemory
    } else {
        FarMallocError::SystemError(e)
    }
}

#[cfg(unix)]
fn libc_enomem() -> i32 {
    libc::ENOMEM
}

#[cfg(windows)]
fn libc_enomem() -> i32 {
    windows_sys::Win32::Foundation::ERROR_NOT_ENOUGH_MEMORY as i32
}

/// A `size`-byte region of anonymous memory, `alignment`-aligned, sitting at
/// `offset` bytes past the nearest `alignment` boundary below it.
///
/// Dropping releases the mapping back to the OS (unconditionally panics on a
/// release failure — these can only come from misuse, not resource limits).
pub struct AlignedRegion {
    ptr: NonNull<u8>,
    size: usize,
    #[cfg(windows)]
    mmap_base: NonNull<u8>,
    #[cfg(windows)]
    mmap_size: usize,
}

// SAFETY: `AlignedRegion` owns an exclusive OS mapping; nothing else aliases it.
unsafe impl Send for AlignedRegion {}

impl AlignedRegion {
    /// Reserves and trims a region of `size` bytes aligned to `alignment`,
    /// sitting `offset` bytes above the alignment boundary.
    ///
    /// `size` must be a positive multiple of the page size; `alignment` must
    /// be a page-size-multiple power of two; `offset` must be a multiple of
    /// the page size and smaller than `alignment`.
    pub fn new(size: usize, alignment: usize, offset: usize) -> Result<Self> {
        assert!(size > 0 && size.is_multiple_of(PAGE_SIZE));
        assert!(alignment > 0 && alignment.is_multiple_of(PAGE_SIZE) && alignment.is_power_of_two());
        assert!(offset.is_multiple_of(PAGE_SIZE) && offset < alignment);

        let padding = alignment - PAGE_SIZE;
        let mmap_size = size + padding;

        // SAFETY: mmap_size is a positive page multiple; we check the result below.
        let mmap_head = unsafe { sys::reserve(mmap_size) }.map_err(from_os_error)?;
        let head_addr = mmap_head as usize;
        let aligned_addr = head_addr.wrapping_sub(offset).div_ceil(alignment) * alignment + offset;

        let head_cut = aligned_addr - head_addr;
        let tail_cut = (head_addr + mmap_size) - (aligned_addr + size);

        #[cfg(unix)]
        {
            if head_cut != 0 {
                // SAFETY: [mmap_head, mmap_head+head_cut) is a prefix of our own mapping.
                unsafe { sys::release(mmap_head, head_cut) }.map_err(from_os_error)?;
            }
            if tail_cut != 0 {
                // SAFETY: the tail bytes are a suffix of our own mapping.
                unsafe { sys::release((aligned_addr + size) as *mut u8, tail_cut) }.map_err(from_os_error)?;
            }
            Ok(Self {
                ptr: NonNull::new(aligned_addr as *mut u8).expect("aligned_addr is non-null"),
                size,
            })
        }

        #[cfg(windows)]
        {
            let _ = (head_cut, tail_cut);
            Ok(Self {
                ptr: NonNull::new(aligned_addr as *mut u8).expect("aligned_addr is non-null"),
                size,
                mmap_base: NonNull::new(mmap_head).expect("mmap_head is non-null"),
                mmap_size,
            })
        }
    }

    /// The aligned base of the usable region.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The usable region's size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: this is the exact mapping returned by `new`, trimmed once at construction.
        unsafe {
            sys::release(self.ptr.as_ptr(), self.size).expect("munmap of an owned region should not fail");
        }
        #[cfg(windows)]
        // SAFETY: `mmap_base` is the untrimmed reservation `new` made; Windows only frees as a whole.
        unsafe {
            sys::release(self.mmap_base.as_ptr(), self.mmap_size).expect("VirtualFree of an owned region should not fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ARENA_SIZE;

    #[test]
    fn region_is_aligned_with_offset() {
        let region = AlignedRegion::new(ARENA_SIZE, ARENA_SIZE, 0).unwrap();
        assert_eq!(region.as_ptr() as usize % ARENA_SIZE, 0);
        assert_eq!(region.size(), ARENA_SIZE);
    }

    #[test]
    fn region_is_writable_end_to_end() {
        let region = AlignedRegion::new(ARENA_SIZE, ARENA_SIZE, 0).unwrap();
        unsafe {
            let slice = std::slice::from_raw_parts_mut(region.as_ptr(), region.size());
            slice[0] = 0xAB;
            slice[region.size() - 1] = 0xCD;
            assert_eq!(slice[0], 0xAB);
            assert_eq!(slice[region.size() - 1], 0xCD);
        }
    }

    #[test]
    fn nonzero_offset_lands_on_boundary_plus_offset() {
        let offset = PAGE_SIZE;
        let region = AlignedRegion::new(ARENA_SIZE, 2 * ARENA_SIZE, offset).unwrap();
        assert_eq!((region.as_ptr() as usize - offset) % (2 * ARENA_SIZE), 0);
    }
}
