//! Error types surfaced by allocation and mode-switching operations.
//!
//! Deallocation is infallible by contract (spec §4.7/§7): nothing in this
//! crate returns a `Result` from a `deallocate` path.

use std::fmt;
use std::io;

/// Failure kinds an allocate or mode-switch operation can report.
#[derive(Debug)]
pub enum FarMallocError {
    /// The operation could not be satisfied because memory (virtual address
    /// space, arena capacity, or the configured purely-local ceiling) ran out.
    OutOfMemory,
    /// An OS-level mismatch (e.g. `mmap`/`munmap` failure unrelated to
    /// resource exhaustion) propagated with its underlying error code.
    SystemError(io::Error),
}

impl fmt::Display for FarMallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FarMallocError::OutOfMemory => f.write_str("out of memory"),
            FarMallocError::SystemError(e) => write!(f, "system error: {e}"),
        }
    }
}

impl std::error::Error for FarMallocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FarMallocError::OutOfMemory => None,
            FarMallocError::SystemError(e) => Some(e),
        }
    }
}

impl From<io::Error> for FarMallocError {
    fn from(e: io::Error) -> Self {
        FarMallocError::SystemError(e)
    }
}

/// Shorthand result type used throughout the allocator engine.
pub type Result<T> = std::result::Result<T, FarMallocError>;
