//! Boundary tags and heap layout.
//!
//! The heap is a single contiguous region, addressed here by byte offsets
//! from its first byte. It is laid out as:
//!
//! ```text
//! | bucket table | pad | prologue hdr | prologue ftr | block | block | ... | epilogue hdr |
//!   BUCKETS words   0       8/1            8/1                                  0/1
//! ```
//!
//! Every block carries a header word before its payload and a footer word at
//! the end of the block, both holding `size | allocated`. Sizes are always
//! multiples of [`DSIZE`], so the low three bits of a tag are free for flags.
//!
//! While a block is free, the first two words of its payload hold the
//! offsets of its neighbours in its free list (0 meaning "none"). While it is
//! allocated, those bytes belong to the caller.

use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::seglist::BUCKETS;

/// Size of a header, footer, or free list link.
pub const WSIZE: usize = 4;

/// The alignment unit. Block sizes and payload addresses are multiples of
/// this.
pub const DSIZE: usize = 8;

/// Header + footer + predecessor and successor links.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// Bytes of every block that are not available to the caller.
pub const OVERHEAD: usize = 2 * WSIZE;

/// Bytes written by initialization before the first real block: the bucket
/// table, one padding word, the prologue block and the epilogue header.
pub const PREAMBLE_SIZE: usize = BUCKETS * WSIZE + 4 * WSIZE;

/// The heap can never be larger than what a tag or link word can address.
pub const MAX_HEAP_SIZE: usize = (u32::MAX as usize) & !(DSIZE - 1);

const_assert!(MIN_BLOCK_SIZE == OVERHEAD + 2 * WSIZE);
const_assert!(PREAMBLE_SIZE % DSIZE == 0);
const_assert!(DSIZE & (DSIZE - 1) == 0);

/// The prologue: an allocated, payload-less block that stops backwards
/// coalescing at the start of the heap.
pub(crate) const PROLOGUE: Block = Block::new(BUCKETS * WSIZE + 2 * WSIZE);

/// Where the first real block's payload starts.
pub(crate) const FIRST_BLOCK: Block = Block::new(PREAMBLE_SIZE);

const ALLOCATED: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

/// Round `size` up to the alignment unit.
///
/// `size` must be at least `DSIZE - 1` below `usize::MAX`.
pub const fn align(size: usize) -> usize {
    (size + DSIZE - 1) & !(DSIZE - 1)
}

/// Pack a block size and allocation bit into a tag word.
pub const fn pack(size: usize, allocated: bool) -> u32 {
    size as u32 | allocated as u32
}

/// The block size stored in a tag word.
pub const fn size_of(word: u32) -> usize {
    (word & SIZE_MASK) as usize
}

/// The allocation bit stored in a tag word.
pub const fn is_allocated(word: u32) -> bool {
    word & ALLOCATED != 0
}

/// A block, named by the heap offset of its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);

impl Block {
    pub(crate) const fn new(offset: usize) -> Block {
        Block(offset)
    }

    /// Offset of the payload from the start of the heap.
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Offset of the header word.
    pub const fn header(self) -> usize {
        self.0 - WSIZE
    }

    /// Offset of the footer word, for a block of `size` bytes.
    pub const fn footer(self, size: usize) -> usize {
        self.0 + size - DSIZE
    }

    const fn pred_link(self) -> usize {
        self.0
    }

    const fn succ_link(self) -> usize {
        self.0 + WSIZE
    }
}

fn decode_link(word: u32) -> Option<Block> {
    match word {
        0 => None,
        offset => Some(Block(offset as usize)),
    }
}

fn encode_link(link: Option<Block>) -> u32 {
    link.map_or(0, |block| block.0 as u32)
}

/// A view of the heap region as an array of words.
///
/// This is a raw pointer and a length, and is `Copy`; it does not borrow the
/// grower, since the grower may move (and the view must then be rebuilt).
///
/// All accessors are safe to call with offsets produced by the allocator
/// itself. Offsets are checked against the region only in debug builds.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HeapView {
    base: *mut u8,
    len: usize,
}

impl HeapView {
    /// # Safety
    ///
    /// `base` must be aligned to `DSIZE` and point to `len` bytes that are
    /// readable, writable, and owned by the allocator for as long as this
    /// view (or any copy of it) is used.
    pub unsafe fn new(base: *mut u8, len: usize) -> HeapView {
        debug_assert!(base as usize % DSIZE == 0 || len == 0);
        HeapView { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn word(&self, offset: usize) -> u32 {
        debug_assert!(offset % WSIZE == 0 && offset + WSIZE <= self.len);
        unsafe { (self.base.add(offset) as *const u32).read() }
    }

    pub fn set_word(&self, offset: usize, value: u32) {
        debug_assert!(offset % WSIZE == 0 && offset + WSIZE <= self.len);
        unsafe { (self.base.add(offset) as *mut u32).write(value) }
    }

    pub fn size(&self, block: Block) -> usize {
        size_of(self.word(block.header()))
    }

    pub fn is_allocated(&self, block: Block) -> bool {
        is_allocated(self.word(block.header()))
    }

    /// Write matching header and footer tags.
    pub fn set_tags(&self, block: Block, size: usize, allocated: bool) {
        let tag = pack(size, allocated);
        self.set_word(block.header(), tag);
        self.set_word(block.footer(size), tag);
    }

    /// The physically following block. For the last block this is the
    /// epilogue.
    pub fn next(&self, block: Block) -> Block {
        Block(block.0 + self.size(block))
    }

    /// The physically preceding block, found through its footer. For the
    /// first block this is the prologue.
    pub fn prev(&self, block: Block) -> Block {
        Block(block.0 - size_of(self.word(block.0 - DSIZE)))
    }

    pub fn pred(&self, block: Block) -> Option<Block> {
        decode_link(self.word(block.pred_link()))
    }

    pub fn succ(&self, block: Block) -> Option<Block> {
        decode_link(self.word(block.succ_link()))
    }

    pub fn set_pred(&self, block: Block, pred: Option<Block>) {
        self.set_word(block.pred_link(), encode_link(pred));
    }

    pub fn set_succ(&self, block: Block, succ: Option<Block>) {
        self.set_word(block.succ_link(), encode_link(succ));
    }

    /// The first block of a bucket.
    pub fn root(&self, bucket: usize) -> Option<Block> {
        debug_assert!(bucket < BUCKETS);
        decode_link(self.word(bucket * WSIZE))
    }

    pub fn set_root(&self, bucket: usize, root: Option<Block>) {
        debug_assert!(bucket < BUCKETS);
        self.set_word(bucket * WSIZE, encode_link(root));
    }

    /// The caller-facing address of a block's payload.
    pub fn payload(&self, block: Block) -> NonNull<u8> {
        debug_assert!(block.0 <= self.len);
        unsafe { NonNull::new_unchecked(self.base.add(block.0)) }
    }

    /// The block owning a payload address handed out by [`payload`](#method.payload).
    pub fn block_of(&self, ptr: NonNull<u8>) -> Block {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base as usize);
        debug_assert!(
            offset >= FIRST_BLOCK.0 && offset < self.len,
            "pointer {:?} is outside of the heap",
            ptr
        );
        Block(offset)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use test_log::test;

    pub(crate) const ARENA_SIZE: usize = 4096;

    #[repr(C, align(16))]
    pub(crate) struct Arena(pub [u8; ARENA_SIZE]);

    impl Arena {
        pub(crate) fn new() -> Self {
            Arena([0; ARENA_SIZE])
        }

        pub(crate) fn view(&mut self) -> HeapView {
            unsafe { HeapView::new(self.0.as_mut_ptr(), ARENA_SIZE) }
        }
    }

    /// Lay out consecutive blocks of the given sizes from the first block
    /// offset onwards, tagged free.
    pub(crate) fn carve(heap: &HeapView, sizes: &[usize]) -> Vec<Block> {
        let mut offset = FIRST_BLOCK.offset();
        sizes
            .iter()
            .map(|&size| {
                let block = Block::new(offset);
                heap.set_tags(block, size, false);
                offset += size;
                block
            })
            .collect()
    }

    #[test]
    fn test_tags() {
        assert_eq!(pack(32, true), 33);
        assert_eq!(pack(4096, false), 4096);
        assert_eq!(size_of(pack(48, true)), 48);
        assert!(is_allocated(pack(48, true)));
        assert!(!is_allocated(pack(48, false)));
        assert_eq!(size_of(pack(0, true)), 0);
    }

    #[test]
    fn test_align() {
        assert_eq!(align(0), 0);
        assert_eq!(align(1), 8);
        assert_eq!(align(8), 8);
        assert_eq!(align(9), 16);
        assert_eq!(align(8008), 8008);
    }

    #[test]
    fn test_navigation() {
        let mut arena = Arena::new();
        let heap = arena.view();

        let blocks = carve(&heap, &[32, 48, 16]);
        heap.set_tags(blocks[1], 48, true);

        assert_eq!(blocks[0].offset(), PREAMBLE_SIZE);
        assert_eq!(heap.next(blocks[0]), blocks[1]);
        assert_eq!(heap.next(blocks[1]), blocks[2]);
        assert_eq!(heap.prev(blocks[2]), blocks[1]);
        assert_eq!(heap.prev(blocks[1]), blocks[0]);

        assert_eq!(heap.size(blocks[1]), 48);
        assert!(heap.is_allocated(blocks[1]));
        assert!(!heap.is_allocated(blocks[2]));
        assert_eq!(
            heap.word(blocks[1].header()),
            heap.word(blocks[1].footer(48))
        );

        // Header sits right before the payload, footer right before the next
        // header.
        assert_eq!(blocks[1].header() + WSIZE, blocks[1].offset());
        assert_eq!(blocks[1].footer(48) + WSIZE, heap.next(blocks[1]).header());
    }

    #[test]
    fn test_links() {
        let mut arena = Arena::new();
        let heap = arena.view();
        let blocks = carve(&heap, &[32, 32]);

        heap.set_pred(blocks[1], Some(blocks[0]));
        heap.set_succ(blocks[1], None);
        assert_eq!(heap.pred(blocks[1]), Some(blocks[0]));
        assert_eq!(heap.succ(blocks[1]), None);

        heap.set_root(3, Some(blocks[1]));
        assert_eq!(heap.root(3), Some(blocks[1]));
        heap.set_root(3, None);
        assert_eq!(heap.root(3), None);
    }

    #[test]
    fn test_payload_round_trip() {
        let mut arena = Arena::new();
        let heap = arena.view();
        let blocks = carve(&heap, &[64]);

        let ptr = heap.payload(blocks[0]);
        assert_eq!(ptr.as_ptr() as usize % DSIZE, 0);
        assert_eq!(heap.block_of(ptr), blocks[0]);
    }
}
