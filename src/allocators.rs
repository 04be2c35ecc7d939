//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`SegAlloc`](struct.SegAlloc.html)
//!
//! A `SegAlloc` is a single-threaded heap manager: it grows one contiguous
//! heap through a [`HeapGrower`](../grower/trait.HeapGrower.html), carves it
//! into blocks with boundary tags, keeps free blocks in segregated free
//! lists, and coalesces neighbours on every free. Because it is not
//! thread-safe, it cannot be used as a global allocator by itself.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps a lazily initialized `SegAlloc` in a spin lock
//! and implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` is a `GenericAllocator` over an
//! [`MmapHeapGrower`](../unix/struct.MmapHeapGrower.html), ready to be used
//! as the `#[global_allocator]`.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use spin::Mutex;

use crate::block::{
    pack, Block, HeapView, DSIZE, FIRST_BLOCK, MAX_HEAP_SIZE, MIN_BLOCK_SIZE, OVERHEAD,
    PREAMBLE_SIZE, PROLOGUE, WSIZE,
};
use crate::check::{self, Blocks, Stats, Validity};
use crate::config::Config;
use crate::error::{AllocError, OutOfMemory};
use crate::grower::HeapGrower;
use crate::seglist::{SegList, BUCKETS};
#[cfg(feature = "use_libc")]
use crate::unix::MmapHeapGrower;

/// Calculate the block size needed to hold `size` bytes of payload.
pub fn block_size(size: usize) -> Option<usize> {
    let padded = size.checked_add(OVERHEAD + DSIZE - 1)? & !(DSIZE - 1);
    Some(padded.max(MIN_BLOCK_SIZE))
}

/// A segregated-fit allocator over one contiguous, growable heap.
///
/// Note: It never returns memory to the grower.
///
/// Every block has a 4-byte header and a 4-byte footer holding its size and
/// allocation bit, so both physical neighbours of a block can be found from
/// its own address. Payloads are 8-byte aligned, and each allocation costs
/// 8 bytes of overhead with a minimum block of 16 bytes.
///
/// Tags and links are 32 bits wide, so the heap is limited to just under
/// 4 GiB; growth past that is reported as out of memory.
pub struct SegAlloc<G> {
    pub grower: G,
    lists: SegList,
    config: Config,
    // Bytes obtained from the grower so far
    heap_len: usize,
}

impl<G: HeapGrower> SegAlloc<G> {
    /// Create an allocator with the default [`Config`](../config/struct.Config.html).
    pub fn init(grower: G) -> Result<Self, OutOfMemory> {
        Self::with_config(grower, Config::DEFAULT)
    }

    /// Create an allocator: lay down the bucket table, the prologue and the
    /// epilogue, and create the initial free block.
    pub fn with_config(grower: G, config: Config) -> Result<Self, OutOfMemory> {
        let mut alloc = SegAlloc {
            grower,
            lists: SegList::new(),
            config: config.normalized(),
            heap_len: 0,
        };

        alloc.grow(PREAMBLE_SIZE)?;
        let heap = alloc.heap();
        alloc.lists.clear(&heap);
        heap.set_word(PROLOGUE.header() - WSIZE, 0);
        heap.set_tags(PROLOGUE, DSIZE, true);
        heap.set_word(FIRST_BLOCK.header(), pack(0, true));

        alloc.extend_heap(alloc.config.initial_chunk)?;
        Ok(alloc)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Total bytes obtained from the grower.
    pub fn heap_size(&self) -> usize {
        self.heap_len
    }

    pub(crate) fn heap(&self) -> HeapView {
        // The grower promises `heap_len` contiguous bytes from `heap_start`.
        unsafe { HeapView::new(self.grower.heap_start(), self.heap_len) }
    }

    /// Get statistics on this allocator, and verify validity of the heap and
    /// its free lists.
    pub fn stats(&self) -> (Validity, Stats) {
        check::validate(self.heap(), &self.lists)
    }

    /// Check every structural invariant. A `false` means the heap is
    /// corrupted and should not be used further.
    pub fn check(&self) -> bool {
        let (validity, _) = self.stats();
        if !validity.is_valid() {
            log::error!("Heap check failed: {:?}", validity);
        }
        validity.is_valid()
    }

    /// Iterate over all blocks in address order.
    pub fn blocks(&self) -> Blocks {
        Blocks::new(self.heap())
    }

    /// Bytes usable at `ptr`, which may be more than were asked for.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let heap = self.heap();
        heap.size(heap.block_of(ptr)) - OVERHEAD
    }

    // Obtain `size` more bytes from the grower, returning the offset they
    // start at.
    fn grow(&mut self, size: usize) -> Result<usize, OutOfMemory> {
        let new_len = match self.heap_len.checked_add(size) {
            Some(len) if len <= MAX_HEAP_SIZE => len,
            _ => {
                log::warn!("Refusing to grow a {} byte heap by {}", self.heap_len, size);
                return Err(OutOfMemory);
            }
        };

        let ptr = match unsafe { self.grower.grow_heap(size) } {
            Ok(ptr) => ptr,
            Err(_) => {
                log::warn!("Heap growth of {} bytes failed", size);
                return Err(OutOfMemory);
            }
        };

        let start = self.grower.heap_start() as usize;
        if ptr.as_ptr() as usize != start + self.heap_len || start % DSIZE != 0 {
            log::warn!(
                "Heap growth returned {:?}, expected {:#x}; the heap is no longer contiguous",
                ptr,
                start + self.heap_len
            );
            return Err(OutOfMemory);
        }

        let offset = self.heap_len;
        self.heap_len = new_len;
        Ok(offset)
    }

    // Grow the heap by `size` bytes and turn them into a free block, merged
    // with a free block before it if there is one.
    fn extend_heap(&mut self, size: usize) -> Result<Block, OutOfMemory> {
        let size = crate::block::align(size);
        let offset = self.grow(size)?;
        log::debug!("Extended heap by {} bytes to {}", size, self.heap_len);

        // The old epilogue header becomes the new block's header.
        let heap = self.heap();
        let block = Block::new(offset);
        heap.set_tags(block, size, false);
        heap.set_word(heap.next(block).header(), pack(0, true));
        self.lists.insert(&heap, block, size);

        Ok(self.coalesce(block))
    }

    /// Allocate `size` bytes, reporting why nothing could be handed out.
    pub fn try_alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidRequest);
        }
        let adj = block_size(size).ok_or(AllocError::OutOfMemory)?;

        let heap = self.heap();
        let block = match self.lists.search(&heap, adj) {
            Some(block) => block,
            None => self.extend_heap(adj.max(self.config.chunk_size))?,
        };

        let placed = self.place(block, adj);
        Ok(self.heap().payload(placed))
    }

    /// Allocate `size` bytes, 8-byte aligned. Returns `None` for a zero size
    /// or when the heap cannot grow.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_alloc(size).ok()
    }

    /// Allocate `size` bytes aligned to `align`, which must be a power of two.
    ///
    /// For alignments above 8 this over-allocates, then gives the slack in
    /// front of the aligned address back to the free lists as its own block,
    /// and trims any excess behind it.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        if align <= DSIZE || size == 0 {
            return self.alloc(size);
        }

        let adj = block_size(size)?;
        let padded = size.checked_add(align)?.checked_add(MIN_BLOCK_SIZE)?;
        let ptr = self.alloc(padded)?;

        let heap = self.heap();
        let block = heap.block_of(ptr);
        let addr = ptr.as_ptr() as usize;
        if addr % align == 0 {
            self.shrink(block, adj);
            return Some(ptr);
        }

        // Leave at least a minimum block in front, so it can be freed.
        let aligned = (addr + MIN_BLOCK_SIZE + align - 1) & !(align - 1);
        let gap = aligned - addr;
        let total = heap.size(block);

        heap.set_tags(block, gap, false);
        let inner = heap.next(block);
        heap.set_tags(inner, total - gap, true);
        self.lists.insert(&heap, block, gap);
        self.coalesce(block);
        self.shrink(inner, adj);

        log::trace!("Aligned {:?} to {} at offset {}", ptr, align, inner.offset());
        Some(heap.payload(inner))
    }

    // Mark part of a free block as allocated, returning the allocated block.
    //
    // A leftover too small to be a block stays with the allocation. Large
    // leftovers stay in front, small ones go behind.
    fn place(&mut self, block: Block, adj: usize) -> Block {
        let heap = self.heap();
        let size = heap.size(block);
        self.lists.remove(&heap, block);

        let remainder = size - adj;
        if remainder < MIN_BLOCK_SIZE {
            heap.set_tags(block, size, true);
            return block;
        }

        if remainder >= self.config.split_threshold {
            heap.set_tags(block, remainder, false);
            let back = heap.next(block);
            heap.set_tags(back, adj, true);
            self.lists.insert(&heap, block, remainder);
            log::trace!(
                "Placed {} at the back of {}:{}",
                adj,
                block.offset(),
                size
            );
            back
        } else {
            heap.set_tags(block, adj, true);
            let back = heap.next(block);
            heap.set_tags(back, remainder, false);
            self.lists.insert(&heap, back, remainder);
            log::trace!(
                "Placed {} at the front of {}:{}",
                adj,
                block.offset(),
                size
            );
            block
        }
    }

    // Merge a listed free block with its free physical neighbours, returning
    // the merged block (which starts at the lowest address involved).
    fn coalesce(&mut self, block: Block) -> Block {
        let heap = self.heap();
        let prev = heap.prev(block);
        let next = heap.next(block);
        let prev_free = !heap.is_allocated(prev);
        let next_free = !heap.is_allocated(next);

        if !prev_free && !next_free {
            return block;
        }

        let mut size = heap.size(block);
        let mut start = block;
        self.lists.remove(&heap, block);
        if next_free {
            self.lists.remove(&heap, next);
            size += heap.size(next);
        }
        if prev_free {
            self.lists.remove(&heap, prev);
            size += heap.size(prev);
            start = prev;
        }

        heap.set_tags(start, size, false);
        self.lists.insert(&heap, start, size);
        log::trace!(
            "Coalesced {} (prev free: {}, next free: {}) into {}:{}",
            block.offset(),
            prev_free,
            next_free,
            start.offset(),
            size
        );
        start
    }

    /// Deallocate (or "free") a memory block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since.
    /// Anything else is undefined behavior; debug builds catch a double free.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let heap = self.heap();
        let block = heap.block_of(ptr);
        debug_assert!(
            heap.is_allocated(block),
            "free of {:?}, which is not allocated",
            ptr
        );

        let size = heap.size(block);
        heap.set_tags(block, size, false);
        self.lists.insert(&heap, block, size);
        self.coalesce(block);
    }

    /// Resize an allocation, in place when possible.
    ///
    /// - `realloc(None, size)` is `alloc(size)`.
    /// - `realloc(Some(ptr), 0)` frees `ptr` and returns `None`.
    /// - Shrinking happens in place; the tail is freed if it can form a block.
    /// - Growing absorbs a free block directly after this one if that is
    ///   enough, and otherwise moves the data to a new allocation.
    ///
    /// Returns `None` if a new allocation was needed and failed, in which case
    /// `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr`, if given, must be a live allocation from this allocator.
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            None => return self.alloc(size),
            Some(ptr) => ptr,
        };
        if size == 0 {
            self.free(ptr);
            return None;
        }

        let heap = self.heap();
        let block = heap.block_of(ptr);
        debug_assert!(
            heap.is_allocated(block),
            "realloc of {:?}, which is not allocated",
            ptr
        );

        let old = heap.size(block) - OVERHEAD;
        let want = block_size(size)? - OVERHEAD;

        if want <= old {
            self.shrink(block, want + OVERHEAD);
            return Some(ptr);
        }
        if self.grow_in_place(block, want + OVERHEAD) {
            return Some(ptr);
        }

        let new = self.alloc(size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old.min(size));
        self.free(ptr);
        Some(new)
    }

    // Shrink an allocated block to `adj` bytes, if what is cut off can stand
    // as a free block of its own.
    fn shrink(&mut self, block: Block, adj: usize) {
        let heap = self.heap();
        let size = heap.size(block);
        if size < adj + MIN_BLOCK_SIZE {
            return;
        }

        heap.set_tags(block, adj, true);
        let tail = heap.next(block);
        heap.set_tags(tail, size - adj, false);
        self.lists.insert(&heap, tail, size - adj);
        self.coalesce(tail);
    }

    // Grow an allocated block to at least `adj` bytes by absorbing a free
    // block right after it. Returns false, changing nothing, if there is no
    // such block or it is too small.
    fn grow_in_place(&mut self, block: Block, adj: usize) -> bool {
        let heap = self.heap();
        let next = heap.next(block);
        if heap.is_allocated(next) {
            return false;
        }

        let total = heap.size(block) + heap.size(next);
        if total < adj {
            return false;
        }

        self.lists.remove(&heap, next);
        if total - adj < MIN_BLOCK_SIZE {
            heap.set_tags(block, total, true);
            return true;
        }

        heap.set_tags(block, adj, true);
        let tail = heap.next(block);
        heap.set_tags(tail, total - adj, false);
        self.lists.insert(&heap, tail, total - adj);
        self.coalesce(tail);
        true
    }
}

impl<G: HeapGrower> fmt::Display for SegAlloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegAlloc(")?;
        let heap = self.heap();
        let mut start = true;
        for bucket in 0..BUCKETS {
            for block in self.lists.iter(&heap, bucket) {
                if !start {
                    write!(f, ", ")?;
                } else {
                    start = false;
                }
                write!(f, "[{}] {}:{}", bucket, block.offset(), heap.size(block))?;
            }
        }
        write!(f, ")")
    }
}

/// A thread-safe allocator, using a spin lock around a `SegAlloc`.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator. The `SegAlloc` is created with `G::default()` on first use; if
/// that fails, allocations return null and creation is retried next time.
pub struct GenericAllocator<G> {
    raw: Mutex<Option<SegAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            raw: Mutex::new(None),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Run `f` on the underlying `SegAlloc`, creating it first if needed.
    ///
    /// Allocation is blocked for every other thread while `f` runs; `f` must
    /// not allocate through this allocator.
    pub fn with_raw<R, F: FnOnce(&mut SegAlloc<G>) -> R>(&self, f: F) -> Option<R> {
        let mut raw = self.raw.lock();
        if raw.is_none() {
            *raw = SegAlloc::init(G::default()).ok();
        }
        raw.as_mut().map(f)
    }

    pub fn stats(&self) -> Option<(Validity, Stats)> {
        self.with_raw(|raw| raw.stats())
    }
}

unsafe impl<G: HeapGrower + Default + Send> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_raw(|raw| raw.alloc_aligned(layout.size(), layout.align()))
            .flatten()
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.with_raw(|raw| raw.free(ptr));
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.with_raw(|raw| {
            if layout.align() <= DSIZE {
                return raw.realloc(NonNull::new(ptr), new_size);
            }
            let new = raw.alloc_aligned(new_size, layout.align())?;
            if let Some(old) = NonNull::new(ptr) {
                ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), layout.size().min(new_size));
                raw.free(old);
            }
            Some(new)
        })
        .flatten()
        .map_or(null_mut(), NonNull::as_ptr)
    }
}

/// A global allocator over anonymous virtual memory.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<MmapHeapGrower>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> Option<(Validity, Stats)> {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}
