//! Segregated free lists.
//!
//! Free blocks are kept in [`BUCKETS`] doubly linked lists, one per
//! power-of-two size class. The lists are intrusive: the bucket roots live in
//! the table at the start of the heap, and the links live in the first two
//! words of each free block's payload. Nothing here allocates.
//!
//! Within a bucket, blocks are kept in ascending size order, so a first-fit
//! scan of a bucket is also a best-fit scan of that bucket.

use crate::block::{Block, HeapView};

/// Number of size classes.
pub const BUCKETS: usize = 20;

/// The size class of a block of `size` bytes: `floor(log2(size))`, with
/// everything from `2^(BUCKETS - 1)` up sharing the last bucket.
pub fn class_index(size: usize) -> usize {
    let mut size = size;
    let mut index = 0;
    while index < BUCKETS - 1 && size > 1 {
        size >>= 1;
        index += 1;
    }
    index
}

/// Bookkeeping for the free lists whose links live inside the heap.
///
/// It maintains a few invariants:
///
/// - Every block in bucket `i` is free and has `class_index(size) == i`.
/// - Each bucket is sorted by ascending size from its root.
/// - For each listed block, `succ(pred(block)) == block` and
///   `pred(succ(block)) == block`.
/// - `len` is the number of listed blocks across all buckets.
#[derive(Debug)]
pub(crate) struct SegList {
    len: usize,
}

/// Iterator over the blocks of one bucket, from smallest to largest.
pub(crate) struct BucketIter {
    heap: HeapView,
    next: Option<Block>,
}

impl Iterator for BucketIter {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = self.heap.succ(block);
        Some(block)
    }
}

impl SegList {
    pub fn new() -> Self {
        SegList { len: 0 }
    }

    /// Number of blocks currently listed.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Empty every bucket.
    pub fn clear(&mut self, heap: &HeapView) {
        for bucket in 0..BUCKETS {
            heap.set_root(bucket, None);
        }
        self.len = 0;
    }

    pub fn iter(&self, heap: &HeapView, bucket: usize) -> BucketIter {
        BucketIter {
            heap: *heap,
            next: heap.root(bucket),
        }
    }

    /// Add a free block of `size` bytes to its bucket, before the first
    /// listed block that is at least as large.
    ///
    /// The block's tags must already record `size`.
    pub fn insert(&mut self, heap: &HeapView, block: Block, size: usize) {
        let bucket = class_index(size);

        let mut pred = None;
        let mut cursor = heap.root(bucket);
        while let Some(current) = cursor {
            if heap.size(current) >= size {
                break;
            }
            pred = Some(current);
            cursor = heap.succ(current);
        }

        heap.set_pred(block, pred);
        heap.set_succ(block, cursor);
        match pred {
            Some(pred) => heap.set_succ(pred, Some(block)),
            None => heap.set_root(bucket, Some(block)),
        }
        if let Some(succ) = cursor {
            heap.set_pred(succ, Some(block));
        }

        self.len += 1;
    }

    /// Unlink a listed block.
    ///
    /// The block's tags must still record the size it was inserted with, as
    /// that is how its bucket is found when it is a root.
    pub fn remove(&mut self, heap: &HeapView, block: Block) {
        let pred = heap.pred(block);
        let succ = heap.succ(block);

        match pred {
            Some(pred) => heap.set_succ(pred, succ),
            None => {
                let bucket = class_index(heap.size(block));
                debug_assert_eq!(heap.root(bucket), Some(block));
                heap.set_root(bucket, succ);
            }
        }
        if let Some(succ) = succ {
            heap.set_pred(succ, pred);
        }

        debug_assert!(self.len > 0);
        self.len -= 1;
    }

    /// Find a free block of at least `size` bytes, without unlinking it.
    ///
    /// Starts at `size`'s own class and moves to larger ones, returning the
    /// smallest adequate block of the first class that has one.
    pub fn search(&self, heap: &HeapView, size: usize) -> Option<Block> {
        (class_index(size)..BUCKETS)
            .find_map(|bucket| self.iter(heap, bucket).find(|&block| heap.size(block) >= size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::block::tests::{carve, Arena};
    use test_log::test;

    fn sizes(list: &SegList, heap: &HeapView, bucket: usize) -> Vec<usize> {
        list.iter(heap, bucket).map(|b| heap.size(b)).collect()
    }

    #[test]
    fn test_class_index() {
        assert_eq!(class_index(0), 0);
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(16), 4);
        assert_eq!(class_index(24), 4);
        assert_eq!(class_index(31), 4);
        assert_eq!(class_index(32), 5);
        assert_eq!(class_index(4096), 12);
        assert_eq!(class_index((1 << 19) - 8), 18);
        assert_eq!(class_index(1 << 19), BUCKETS - 1);
        assert_eq!(class_index(1 << 30), BUCKETS - 1);
    }

    #[test]
    fn test_insert_keeps_ascending_order() {
        let mut arena = Arena::new();
        let heap = arena.view();
        let mut list = SegList::new();
        list.clear(&heap);

        let blocks = carve(&heap, &[48, 32, 56, 40]);
        for &block in &blocks {
            list.insert(&heap, block, heap.size(block));
        }

        assert_eq!(list.len(), 4);
        assert_eq!(sizes(&list, &heap, 5), vec![32, 40, 48, 56]);
        assert_eq!(heap.root(5), Some(blocks[1]));
        for bucket in (0..BUCKETS).filter(|&b| b != 5) {
            assert_eq!(heap.root(bucket), None);
        }
    }

    #[test]
    fn test_equal_sizes_go_first() {
        let mut arena = Arena::new();
        let heap = arena.view();
        let mut list = SegList::new();
        list.clear(&heap);

        let blocks = carve(&heap, &[32, 32]);
        list.insert(&heap, blocks[0], 32);
        list.insert(&heap, blocks[1], 32);

        let order: Vec<Block> = list.iter(&heap, 5).collect();
        assert_eq!(order, vec![blocks[1], blocks[0]]);
    }

    #[test]
    fn test_remove() {
        let mut arena = Arena::new();
        let heap = arena.view();
        let mut list = SegList::new();
        list.clear(&heap);

        let blocks = carve(&heap, &[32, 40, 48, 56]);
        for &block in &blocks {
            list.insert(&heap, block, heap.size(block));
        }

        // Middle
        list.remove(&heap, blocks[1]);
        assert_eq!(sizes(&list, &heap, 5), vec![32, 48, 56]);
        assert_eq!(heap.pred(blocks[2]), Some(blocks[0]));

        // Head
        list.remove(&heap, blocks[0]);
        assert_eq!(sizes(&list, &heap, 5), vec![48, 56]);
        assert_eq!(heap.root(5), Some(blocks[2]));
        assert_eq!(heap.pred(blocks[2]), None);

        // Tail
        list.remove(&heap, blocks[3]);
        assert_eq!(sizes(&list, &heap, 5), vec![48]);
        assert_eq!(heap.succ(blocks[2]), None);

        // Last one
        list.remove(&heap, blocks[2]);
        assert_eq!(heap.root(5), None);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_search() {
        let mut arena = Arena::new();
        let heap = arena.view();
        let mut list = SegList::new();
        list.clear(&heap);

        let blocks = carve(&heap, &[56, 32, 40, 128]);
        for &block in &blocks {
            list.insert(&heap, block, heap.size(block));
        }

        // Best fit within the starting class
        assert_eq!(list.search(&heap, 40), Some(blocks[2]));
        assert_eq!(list.search(&heap, 33), Some(blocks[2]));
        assert_eq!(list.search(&heap, 16), Some(blocks[1]));
        // Nothing adequate in class 5, move on to the next non-empty class
        assert_eq!(list.search(&heap, 60), Some(blocks[3]));
        assert_eq!(list.search(&heap, 64), Some(blocks[3]));
        // Nothing anywhere
        assert_eq!(list.search(&heap, 136), None);

        // Searching does not unlink
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_top_bucket_is_catch_all() {
        let mut arena = Arena::new();
        let heap = arena.view();
        let mut list = SegList::new();
        list.clear(&heap);

        // Tags only need to claim the sizes; the list never touches the
        // payload beyond the links.
        let block = carve(&heap, &[64])[0];
        heap.set_word(block.header(), crate::block::pack(1 << 24, false));
        list.insert(&heap, block, 1 << 24);

        assert_eq!(heap.root(BUCKETS - 1), Some(block));
        assert_eq!(list.search(&heap, 1 << 20), Some(block));
        assert_eq!(list.search(&heap, (1 << 24) + 8), None);
    }
}
