//! Heap reservations and raw page vending.
//!
//! A `Heap` is one contiguous 128 MiB anonymous mapping reserved with no
//! access and no backing store. Pages are claimed by flipping bits in a
//! 64-bit bitmap with compare-and-swap; claiming grants read/write to the
//! 2 MiB range, releasing revokes access and advises the OS to drop the
//! backing memory.
//!
//! Alignment loss is at most one page per mapping (when the mapping is not
//! 2 MiB aligned), modelled by pre-setting the top bitmap bit.

use crate::{HEAP_MMAP_SIZE, PAGE_SIZE, PAGE_SIZE_LG2};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// One 128 MiB reservation holding up to 64 pages.
///
/// Heaps are allocated once, linked into the runtime's heap list, and only
/// unmapped when empty. The bitmap is the sole point of contention.
pub struct Heap {
    /// Next heap in the runtime's list (older heaps). Immutable after link.
    pub next: *mut Heap,
    mem_start: *mut u8,
    page_bitmap: AtomicU64,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

/// Round an address down to its page base.
#[inline]
pub fn page_floor(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round an address up to the next page base.
#[inline]
pub fn page_ceil(addr: usize) -> usize {
    page_floor(addr + (PAGE_SIZE - 1))
}

impl Heap {
    /// Reserve address space for a new heap. Returns null if the OS is out
    /// of address space (or memory for the header).
    pub fn try_create() -> *mut Heap {
        let mem_start = unsafe {
            libc::mmap(
                ptr::null_mut(),
                HEAP_MMAP_SIZE,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if mem_start == libc::MAP_FAILED {
            tracing::debug!("mmap failed to reserve heap address space");
            return ptr::null_mut();
        }
        let heap = Box::new(Heap {
            next: ptr::null_mut(),
            mem_start: mem_start.cast(),
            page_bitmap: AtomicU64::new(0),
        });
        heap.page_bitmap
            .store(heap.initial_bitmap(), Ordering::Relaxed);
        tracing::debug!(start = ?heap.mem_start, "reserved heap");
        Box::into_raw(heap)
    }

    /// Unmap an empty heap. The heap pointer is invalid afterwards.
    ///
    /// # Safety
    /// `heap` must have come from [`Heap::try_create`], be empty, and be
    /// unlinked from the runtime's heap list.
    pub unsafe fn destroy(heap: *mut Heap) {
        unsafe {
            debug_assert!((*heap).is_empty());
            if libc::munmap((*heap).mem_start.cast(), HEAP_MMAP_SIZE) != 0 {
                // address-space leak, not a halting error
                tracing::debug!("munmap failed while destroying heap");
            }
            drop(Box::from_raw(heap));
        }
    }

    /// First page-aligned address inside the reservation.
    #[inline]
    pub fn pages_start(&self) -> usize {
        page_ceil(self.mem_start as usize)
    }

    /// Whether `addr` falls inside this reservation.
    #[inline]
    pub fn includes(&self, addr: usize) -> bool {
        let start = self.mem_start as usize;
        addr >= start && addr < start + HEAP_MMAP_SIZE
    }

    /// Bitmap with unusable slots pre-set. At most the last page is lost to
    /// alignment; that address space is never backed by RAM.
    fn initial_bitmap(&self) -> u64 {
        let is_aligned = self.pages_start() == self.mem_start as usize;
        if is_aligned { 0 } else { 1u64 << 63 }
    }

    /// Whether no pages are currently claimed.
    pub fn is_empty(&self) -> bool {
        self.page_bitmap.load(Ordering::Relaxed) == self.initial_bitmap()
    }

    /// Whether every page slot is claimed.
    pub fn is_full(&self) -> bool {
        self.page_bitmap.load(Ordering::Relaxed) == u64::MAX
    }

    /// Claim the lowest free page slot and make it read-writable.
    ///
    /// Returns the page base address, or null if the heap is full or the
    /// OS refuses to commit the range.
    pub fn try_alloc_page(&self) -> *mut u8 {
        let mut bitmap = self.page_bitmap.load(Ordering::Relaxed);
        while bitmap != u64::MAX {
            let ix = (!bitmap).trailing_zeros() as usize;
            let bit = 1u64 << ix;
            bitmap = self.page_bitmap.fetch_or(bit, Ordering::Acquire);
            if bitmap & bit == 0 {
                // won the race for this slot
                let page = (self.pages_start() + ix * PAGE_SIZE) as *mut u8;
                let rc = unsafe {
                    libc::mprotect(page.cast(), PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE)
                };
                if rc != 0 {
                    tracing::debug!(?page, "mprotect failed to commit page");
                    return ptr::null_mut();
                }
                tracing::trace!(?page, ix, "allocated page from heap");
                return page;
            }
        }
        ptr::null_mut()
    }

    /// Release a page back to the reservation: revoke access, drop backing
    /// memory, clear the bitmap bit.
    ///
    /// # Safety
    /// `page` must be a page base inside this heap with no live cells.
    pub unsafe fn free_page(&self, page: *mut u8) {
        let addr = page as usize;
        debug_assert_eq!(page_floor(addr), addr);
        debug_assert!(self.includes(addr));
        let ix = (addr - self.pages_start()) >> PAGE_SIZE_LG2;
        debug_assert!(ix < 64);
        unsafe {
            if libc::mprotect(page.cast(), PAGE_SIZE, libc::PROT_NONE) != 0 {
                tracing::debug!(?page, "mprotect failed while freeing page");
            }
            if libc::madvise(page.cast(), PAGE_SIZE, libc::MADV_DONTNEED) != 0 {
                tracing::debug!(?page, "madvise failed while freeing page");
            }
        }
        self.page_bitmap.fetch_and(!(1u64 << ix), Ordering::Release);
        tracing::trace!(?page, ix, "returned page to heap");
    }

    /// Call `f` on the base address of every claimed page slot.
    ///
    /// The bitmap is read once; pages claimed concurrently may be missed,
    /// which is only acceptable while mutators are stopped.
    pub fn for_each_claimed(&self, mut f: impl FnMut(usize)) {
        let bitmap = self.page_bitmap.load(Ordering::Acquire);
        let start = self.pages_start();
        let mut rem = bitmap & !(if self.initial_bitmap() != 0 { 1u64 << 63 } else { 0 });
        while rem != 0 {
            let ix = rem.trailing_zeros() as usize;
            rem &= rem - 1;
            f(start + ix * PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release() {
        let heap = Heap::try_create();
        assert!(!heap.is_null());
        let heap_ref = unsafe { &*heap };
        assert!(heap_ref.is_empty());
        let page = heap_ref.try_alloc_page();
        assert!(!page.is_null());
        assert_eq!(page_floor(page as usize), page as usize);
        assert!(!heap_ref.is_empty());
        unsafe {
            heap_ref.free_page(page);
            assert!(heap_ref.is_empty());
            Heap::destroy(heap);
        }
    }

    #[test]
    fn claims_lowest_slot_first() {
        let heap = Heap::try_create();
        assert!(!heap.is_null());
        let heap_ref = unsafe { &*heap };
        let a = heap_ref.try_alloc_page();
        let b = heap_ref.try_alloc_page();
        assert_eq!(a as usize + PAGE_SIZE, b as usize);
        unsafe {
            heap_ref.free_page(a);
            let c = heap_ref.try_alloc_page();
            assert_eq!(a, c);
            heap_ref.free_page(b);
            heap_ref.free_page(c);
            Heap::destroy(heap);
        }
    }
}
