#![cfg_attr(not(test), no_std)]

//! A segregated-fit memory allocator.
//!
//! The heap is one contiguous region obtained piece by piece from a
//! [`HeapGrower`]. It is carved into blocks carrying a boundary tag at each
//! end, and free blocks are kept in twenty size-class buckets, each sorted by
//! size. Freed blocks are merged with free neighbours immediately.
//!
//! [`SegAlloc`] is the single-threaded heap manager. [`GenericAllocator`]
//! puts one behind a spin lock and implements `GlobalAlloc`, and with the
//! `use_libc` feature [`UnixAllocator`] does the same over virtual memory:
//!
//! ```no_run
//! use seglist_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//!
//! fn main() {
//!     let v = vec![1u32, 2, 3];
//!     assert_eq!(v.iter().sum::<u32>(), 6);
//! }
//! ```

pub mod allocators;
pub mod block;
pub mod check;
pub mod config;
pub mod error;
pub mod grower;
pub mod seglist;
#[cfg(feature = "use_libc")]
pub mod unix;

#[cfg(feature = "use_libc")]
pub use allocators::UnixAllocator;
pub use allocators::{GenericAllocator, SegAlloc};
pub use check::{BlockInfo, Blocks, Stats, Validity};
pub use config::Config;
pub use error::{AllocError, OutOfMemory};
pub use grower::{HeapGrower, ToyHeap};
#[cfg(feature = "use_libc")]
pub use unix::MmapHeapGrower;
