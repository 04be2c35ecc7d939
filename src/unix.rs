//! A heap grower backed by anonymous virtual memory.
//!
//! The allocator needs its heap to be one contiguous region, which separate
//! `mmap` calls do not promise and `sbrk` only promises when nobody else uses
//! it. Instead, one large range of address space is reserved up front with no
//! access rights, and pages are made readable and writable as the heap grows
//! into them.

use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::grower::HeapGrower;

/// Round value up to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// Address space reserved by default: 1 GiB.
pub const DEFAULT_RESERVE: usize = 1 << 30;

pub struct MmapHeapGrower {
    base: Option<NonNull<u8>>,
    reserve: usize,
    // Bytes handed out
    brk: usize,
    // Bytes made accessible; always a whole number of pages
    committed: usize,
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

// The grower owns its mapping outright; nothing else holds the base pointer
// except the allocator it is handed to.
unsafe impl Send for MmapHeapGrower {}

impl Default for MmapHeapGrower {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVE)
    }
}

impl MmapHeapGrower {
    /// A grower that will never hand out more than `reserve` bytes. Nothing is
    /// mapped until the first growth.
    pub const fn new(reserve: usize) -> Self {
        MmapHeapGrower {
            base: None,
            reserve,
            brk: 0,
            committed: 0,
            pages: 0,
            growths: 0,
        }
    }

    /// Pages committed so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Successful growths so far.
    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Bytes handed out so far.
    pub fn size(&self) -> usize {
        self.brk
    }

    unsafe fn reserve(&mut self) -> Result<NonNull<u8>, Errno> {
        if let Some(base) = self.base {
            return Ok(base);
        }

        let pagesize = sysconf::page::pagesize();
        self.reserve = round_up(self.reserve, pagesize);

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            self.reserve,
            // No access until committed
            libc::PROT_NONE,
            // MAP_ANON: no file behind it. MAP_PRIVATE: not shared with any
            // other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let base = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;
        log::debug!("Reserved {} bytes of address space at {:?}", self.reserve, base);
        self.base = Some(base);
        Ok(base)
    }
}

impl HeapGrower for MmapHeapGrower {
    type Err = Errno;

    fn heap_start(&self) -> *mut u8 {
        self.base.map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        let base = self.reserve()?;

        let end = match self.brk.checked_add(size) {
            Some(end) if end <= self.reserve => end,
            _ => return Err(Errno(libc::ENOMEM)),
        };

        if end > self.committed {
            let pagesize = sysconf::page::pagesize();
            let commit_end = round_up(end, pagesize).min(self.reserve);
            let rc = libc::mprotect(
                base.as_ptr().add(self.committed) as *mut libc::c_void,
                commit_end - self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if rc != 0 {
                return Err(errno::errno());
            }
            self.pages += (commit_end - self.committed) / pagesize;
            self.committed = commit_end;
        }

        let ptr = base.as_ptr().add(self.brk);
        self.brk = end;
        self.growths += 1;
        Ok(NonNull::new_unchecked(ptr))
    }
}

impl Drop for MmapHeapGrower {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe {
                libc::munmap(base.as_ptr() as *mut libc::c_void, self.reserve);
            }
        }
    }
}
