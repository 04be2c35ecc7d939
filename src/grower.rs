//! Sources of heap memory.
//!
//! A [`HeapGrower`] hands out one contiguous region, a piece at a time. The
//! allocator never gives memory back.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;

pub trait HeapGrower {
    type Err;

    /// The first byte of the region. Only meaningful once the heap has grown
    /// at least once; must be aligned to 8 bytes.
    fn heap_start(&self) -> *mut u8;

    /// Grow the heap by exactly `size` bytes, returning a pointer to the
    /// first new byte.
    ///
    /// # Safety
    ///
    /// For this to function properly with the allocator:
    ///
    /// - The new bytes must start exactly where the previous growth ended
    ///   (or at `heap_start()` for the first growth), so that the whole
    ///   region stays contiguous.
    /// - The memory must be readable, writable, and untracked by any other
    ///   Rust code, including the allocator itself.
    /// - The allocator must not be called from within this method.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;
}

pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A static array pretending to be a heap. Mainly useful for testing.
///
/// The array lives inline, so a `ToyHeap` can be moved around (the allocator
/// rebuilds its view of the heap on every call); pointers handed out before
/// a move do not follow it.
#[repr(C, align(16))]
pub struct ToyHeap {
    heap: UnsafeCell<[u8; TOY_HEAP_SIZE]>,
    /// Bytes handed out so far.
    pub size: usize,
    /// Growth beyond this many bytes fails.
    pub limit: usize,
    /// Number of successful growths.
    pub growths: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: UnsafeCell::new([0; TOY_HEAP_SIZE]),
            size: 0,
            limit: TOY_HEAP_SIZE,
            growths: 0,
        }
    }
}

impl ToyHeap {
    /// A heap that refuses to grow beyond `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: limit.min(TOY_HEAP_SIZE),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToyHeapOverflowError();

impl fmt::Display for ToyHeapOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "toy heap exhausted")
    }
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn heap_start(&self) -> *mut u8 {
        self.heap.get() as *mut u8
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        match self.size.checked_add(size) {
            Some(end) if end <= self.limit => {
                let ptr = self.heap_start().add(self.size);
                self.size = end;
                self.growths += 1;
                Ok(NonNull::new_unchecked(ptr))
            }
            _ => Err(ToyHeapOverflowError()),
        }
    }
}
