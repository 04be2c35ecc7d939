//! Grows a heap by hand with `MmapHeapGrower`, then runs a `SegAlloc` on top
//! of another one and prints its free lists as they change.

use seglist_allocator::{HeapGrower, MmapHeapGrower, SegAlloc};

fn main() {
    env_logger::init();

    let mut grower = MmapHeapGrower::new(1 << 20);
    for &size in [96usize, 2048, 8000].iter() {
        match unsafe { grower.grow_heap(size) } {
            Ok(ptr) => println!(
                "Grew by {:>5}: {:p}, {} bytes in {} pages",
                size,
                ptr,
                grower.size(),
                grower.pages()
            ),
            Err(e) => println!("Growing by {} failed: {}", size, e),
        }
    }

    let mut alloc = match SegAlloc::init(MmapHeapGrower::default()) {
        Ok(alloc) => alloc,
        Err(e) => {
            println!("Could not create allocator: {}", e);
            return;
        }
    };
    println!("\nFresh:      {}", alloc);

    let small = alloc.alloc(24);
    let large = alloc.alloc(8000);
    println!("Allocated:  {}", alloc);

    for ptr in [small, large].iter().flatten() {
        unsafe { alloc.free(*ptr) };
    }
    println!("Freed:      {}", alloc);

    let (validity, stats) = alloc.stats();
    println!("\n{:?}\n{:?}", stats, validity);
}
