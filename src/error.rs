//! Errors reported to callers.
//!
//! Misuse of the allocator (freeing a foreign pointer, freeing twice) is not
//! an error: it is a broken precondition, and the behavior is undefined.

use core::fmt;

/// The heap could not be grown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of memory: the heap could not be grown")
    }
}

/// Why an allocation produced no memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The heap could not be grown to fit the request.
    OutOfMemory,
    /// Zero bytes were requested. Not a failure as such: there is simply
    /// nothing to hand out.
    InvalidRequest,
}

impl From<OutOfMemory> for AllocError {
    fn from(_: OutOfMemory) -> Self {
        AllocError::OutOfMemory
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => OutOfMemory.fmt(f),
            AllocError::InvalidRequest => write!(f, "invalid request: zero bytes requested"),
        }
    }
}
