//! Tunable constants.

use crate::block::{align, MIN_BLOCK_SIZE};

/// Allocator tuning knobs. None of them affect correctness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// When placing a request in a larger free block, leftovers at least
    /// this large stay at the front of the block (and the allocation is
    /// taken from the back); smaller leftovers trail the allocation.
    pub split_threshold: usize,
    /// Minimum number of bytes to grow the heap by when no free block fits.
    pub chunk_size: usize,
    /// Bytes of free space created by initialization.
    pub initial_chunk: usize,
}

impl Config {
    pub const DEFAULT: Config = Config {
        split_threshold: 250,
        chunk_size: 1 << 12,
        initial_chunk: 1 << 11,
    };

    pub fn with_split_threshold(self, split_threshold: usize) -> Self {
        Config {
            split_threshold,
            ..self
        }
    }

    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        Config { chunk_size, ..self }
    }

    pub fn with_initial_chunk(self, initial_chunk: usize) -> Self {
        Config {
            initial_chunk,
            ..self
        }
    }

    /// Round the growth sizes to whole blocks.
    pub fn normalized(self) -> Self {
        let chunk = |size: usize| align(size.max(MIN_BLOCK_SIZE).min(usize::MAX - 8));
        Config {
            split_threshold: self.split_threshold,
            chunk_size: chunk(self.chunk_size),
            initial_chunk: chunk(self.initial_chunk),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}
