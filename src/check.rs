//! Heap consistency checking.
//!
//! None of this is on the allocation path; it walks the whole heap and every
//! bucket, and is meant for tests and debugging.

use core::ptr::NonNull;

use crate::block::{
    is_allocated, pack, size_of, Block, HeapView, DSIZE, FIRST_BLOCK, MIN_BLOCK_SIZE, PROLOGUE,
};
use crate::seglist::{class_index, SegList, BUCKETS};

/// Validity contains a representation of all invalid states found in a heap.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Blocks whose payload offset or size is not a multiple of 8, or whose
    /// size is below the minimum. The physical walk stops at the first one.
    pub misaligned: usize,
    /// Free blocks whose header and footer disagree.
    pub tag_mismatches: usize,
    /// Free blocks directly following another free block. Coalescing should
    /// make this impossible between operations.
    pub adjacent_free: usize,
    /// A damaged prologue or epilogue, or a block running past the heap end.
    pub bad_sentinels: usize,
    /// Listed blocks that are marked allocated.
    pub listed_allocated: usize,
    /// Listed blocks whose size belongs to another bucket.
    pub wrong_bucket: usize,
    /// Listed blocks smaller than their predecessor in the bucket.
    pub out_of_orders: usize,
    /// Predecessor links that do not point back along the list, links that
    /// leave the heap, and lists that loop.
    pub broken_links: usize,
    /// Disagreements between the number of free blocks in the heap, the
    /// number reachable from the buckets, and the running counter.
    pub count_mismatches: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Total bytes obtained from the grower.
    pub heap_size: usize,
    pub free_blocks: usize,
    pub free_size: usize,
    pub allocated_blocks: usize,
    pub allocated_size: usize,
}

/// One block found by walking the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address (whether or not the block is allocated).
    pub payload: NonNull<u8>,
    /// Block size, including header and footer.
    pub size: usize,
    pub allocated: bool,
}

/// Iterator over the blocks of a heap in address order, excluding the
/// prologue and epilogue. Stops early on anything that does not look like a
/// block.
pub struct Blocks {
    heap: HeapView,
    next: Option<Block>,
}

impl Blocks {
    pub(crate) fn new(heap: HeapView) -> Self {
        let next = if heap.len() > FIRST_BLOCK.offset() {
            Some(FIRST_BLOCK)
        } else {
            None
        };
        Blocks { heap, next }
    }
}

impl Iterator for Blocks {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        // The epilogue's "payload" is the end of the heap.
        if block.offset() >= self.heap.len() {
            return None;
        }

        let word = self.heap.word(block.header());
        let size = size_of(word);
        if size < MIN_BLOCK_SIZE || block.offset() + size > self.heap.len() {
            return None;
        }

        self.next = Some(Block::new(block.offset() + size));
        Some(BlockInfo {
            payload: self.heap.payload(block),
            size,
            allocated: is_allocated(word),
        })
    }
}

/// Walk the heap and the free lists, checking every invariant the allocator
/// relies on.
pub(crate) fn validate(heap: HeapView, lists: &SegList) -> (Validity, Stats) {
    let mut validity: Validity = Default::default();
    let mut stats = Stats {
        heap_size: heap.len(),
        ..Default::default()
    };

    if heap.len() < FIRST_BLOCK.offset() {
        validity.bad_sentinels += 1;
        return (validity, stats);
    }

    let prologue = pack(DSIZE, true);
    if heap.word(PROLOGUE.header()) != prologue || heap.word(PROLOGUE.footer(DSIZE)) != prologue {
        validity.bad_sentinels += 1;
    }

    // Physical walk, prologue to epilogue
    let mut block = FIRST_BLOCK;
    let mut previous_free = false;
    loop {
        if block.offset() > heap.len() {
            validity.bad_sentinels += 1;
            break;
        }

        let word = heap.word(block.header());
        let size = size_of(word);
        if size == 0 {
            // This had better be the epilogue.
            if !is_allocated(word) || block.offset() != heap.len() {
                validity.bad_sentinels += 1;
            }
            break;
        }

        if block.offset() % DSIZE != 0 || size < MIN_BLOCK_SIZE {
            validity.misaligned += 1;
            break;
        }
        if block.offset() + size > heap.len() {
            validity.bad_sentinels += 1;
            break;
        }

        if is_allocated(word) {
            stats.allocated_blocks += 1;
            stats.allocated_size += size;
            previous_free = false;
        } else {
            if heap.word(block.footer(size)) != word {
                validity.tag_mismatches += 1;
            }
            if previous_free {
                validity.adjacent_free += 1;
            }
            stats.free_blocks += 1;
            stats.free_size += size;
            previous_free = true;
        }

        block = Block::new(block.offset() + size);
    }

    // List walk, bucket by bucket
    let max_steps = heap.len() / MIN_BLOCK_SIZE + 1;
    let mut listed = 0;
    for bucket in 0..BUCKETS {
        let mut pred = None;
        let mut last_size = 0;
        let mut steps = 0;
        let mut cursor = heap.root(bucket);

        while let Some(current) = cursor {
            steps += 1;
            let offset = current.offset();
            if steps > max_steps
                || offset < FIRST_BLOCK.offset()
                || offset >= heap.len()
                || offset % DSIZE != 0
            {
                validity.broken_links += 1;
                break;
            }

            let word = heap.word(current.header());
            let size = size_of(word);
            if is_allocated(word) {
                validity.listed_allocated += 1;
            }
            if class_index(size) != bucket {
                validity.wrong_bucket += 1;
            }
            if size < last_size {
                validity.out_of_orders += 1;
            }
            if heap.pred(current) != pred {
                validity.broken_links += 1;
            }

            listed += 1;
            last_size = size;
            pred = Some(current);
            cursor = heap.succ(current);
        }
    }

    if listed != lists.len() || stats.free_blocks != lists.len() {
        validity.count_mismatches += 1;
    }

    (validity, stats)
}
