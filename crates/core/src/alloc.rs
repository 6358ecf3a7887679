//! Cell allocation: bitmap scan within a per-context page.
//!
//! The allocator owns one page at a time (state PAGE_ALLOC_TARGET) and
//! scans its `marked` bitmap for clear bits; each clear bit is a free cell
//! slot. Sweeping is lazy: the bitmap written by the previous collection
//! *is* the free list. After every collection the cursor rewinds so slots
//! freed behind it are found again.
//!
//! Page acquisition order: runtime free list, then the head heap, then a
//! freshly reserved heap.

use crate::cell::Cell;
use crate::gc;
use crate::mem::Heap;
use crate::page::{PAGE_ACTIVE, PAGE_ALLOC_TARGET, PAGE_FREE, PAGE_HEADER_CELLS, Page};
use crate::rt::rt;
use crate::PAGE_CELL_COUNT;
use std::ptr;
use std::sync::atomic::Ordering;

/// Per-context allocation state.
pub struct AllocCursor {
    page: *mut Page,
    next_slot: usize,
    seen_cycle: u64,
    /// Lifetime cell count; clients diff this for step quotas.
    pub allocated: u64,
}

unsafe impl Send for AllocCursor {}

impl Default for AllocCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocCursor {
    pub const fn new() -> Self {
        AllocCursor {
            page: ptr::null_mut(),
            next_slot: PAGE_HEADER_CELLS,
            seen_cycle: 0,
            allocated: 0,
        }
    }

    /// Allocate one zeroed cell. Returns null only when the process is out
    /// of address space.
    ///
    /// Must be called from a thread in the Busy state.
    pub fn alloc(&mut self) -> *mut Cell {
        let cycles = rt().gc.cycles.load(Ordering::Acquire);
        if cycles != self.seen_cycle {
            // a collection completed; slots behind the cursor may be free
            self.seen_cycle = cycles;
            self.next_slot = PAGE_HEADER_CELLS;
        }
        loop {
            if self.page.is_null() {
                self.page = acquire_page();
                if self.page.is_null() {
                    tracing::debug!("allocator out of memory");
                    return ptr::null_mut();
                }
                self.next_slot = PAGE_HEADER_CELLS;
            }
            let page = unsafe { &*self.page };
            if let Some(ix) = scan_free_slot(page, self.next_slot) {
                self.next_slot = ix + 1;
                self.allocated += 1;
                page.occupancy.fetch_add(1, Ordering::Relaxed);
                let cell = page.cell_at(ix);
                unsafe { ptr::write_bytes(cell.cast::<u8>(), 0, crate::CELL_SIZE) };
                if gc::marking_active() {
                    // allocate black: the new cell survives this wave
                    Page::set_mark(page.marking(), ix);
                }
                return cell;
            }
            // page exhausted: retire it and fetch another
            page.state.store(PAGE_ACTIVE, Ordering::Release);
            self.page = ptr::null_mut();
        }
    }

    /// Retire the current allocation page, if any. Called when the owning
    /// context drops.
    pub fn retire(&mut self) {
        if !self.page.is_null() {
            unsafe { (*self.page).state.store(PAGE_ACTIVE, Ordering::Release) };
            self.page = ptr::null_mut();
        }
    }
}

/// Find the next clear bit in the page's `marked` bitmap at or after
/// `from`, skipping nothing below the header.
fn scan_free_slot(page: &Page, from: usize) -> Option<usize> {
    let bm = page.marked();
    let mut ix = from.max(PAGE_HEADER_CELLS);
    while ix < PAGE_CELL_COUNT {
        let word = bm[ix / 64].load(Ordering::Relaxed);
        let free = !word >> (ix % 64);
        if free != 0 {
            // PAGE_CELL_COUNT is word-aligned, so the slot is in range
            return Some(ix + free.trailing_zeros() as usize);
        }
        ix = (ix / 64 + 1) * 64;
    }
    None
}

/// Acquire a page for allocation, in order: free list, head heap, fresh
/// heap. The returned page is initialized and in state PAGE_ALLOC_TARGET.
pub fn acquire_page() -> *mut Page {
    loop {
        let page = match try_pop_free_list() {
            Some(p) => p,
            None => try_alloc_from_heaps(),
        };
        if !page.is_null() {
            unsafe { (*page).state.store(PAGE_ALLOC_TARGET, Ordering::Release) };
            note_page_allocated();
            return page;
        }
        if !try_add_heap() {
            return ptr::null_mut();
        }
    }
}

fn try_pop_free_list() -> Option<*mut Page> {
    let head = &rt().free_pages;
    let mut page = head.load(Ordering::Acquire);
    while !page.is_null() {
        let next = unsafe { (*page).next.load(Ordering::Acquire) };
        match head.compare_exchange_weak(page, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                rt().free_count.fetch_sub(1, Ordering::Release);
                // reinitialize for a clean slate
                let heap = unsafe { (*page).heap };
                return Some(unsafe { Page::init(heap, page.cast::<u8>()) });
            }
            Err(actual) => page = actual,
        }
    }
    None
}

fn try_alloc_from_heaps() -> *mut Page {
    let heap = rt().heaps.load(Ordering::Acquire);
    if heap.is_null() {
        return ptr::null_mut();
    }
    let addr = unsafe { (*heap).try_alloc_page() };
    if addr.is_null() {
        return ptr::null_mut();
    }
    unsafe { Page::init(heap, addr) }
}

/// Ensure the head of the heap list is not full. Returns false when no
/// new heap can be reserved.
fn try_add_heap() -> bool {
    let cur = rt().heaps.load(Ordering::Acquire);
    if !cur.is_null() && !unsafe { (*cur).is_full() } {
        return true;
    }
    let new_heap = Heap::try_create();
    if new_heap.is_null() {
        return false;
    }
    unsafe { (*new_heap).next = cur };
    let mut expected = cur;
    loop {
        match rt().heaps.compare_exchange_weak(
            expected,
            new_heap,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => {
                if !actual.is_null() && !unsafe { (*actual).is_full() } {
                    // someone else provided a non-full head heap
                    unsafe { Heap::destroy(new_heap) };
                    tracing::debug!("heap created then destroyed in race");
                    return true;
                }
                expected = actual;
                unsafe { (*new_heap).next = actual };
            }
        }
    }
}

/// Return an empty page to the runtime free list (or the OS when the list
/// is long enough). Collector-only.
pub(crate) fn release_page(page: *mut Page) {
    let keep = rt().tuning.free_pages_keep.load(Ordering::Relaxed);
    if rt().free_count.load(Ordering::Acquire) >= keep {
        unsafe {
            let heap = (*page).heap;
            (*heap).free_page(page.cast::<u8>());
        }
        return;
    }
    unsafe { (*page).state.store(PAGE_FREE, Ordering::Release) };
    let head = &rt().free_pages;
    let mut cur = head.load(Ordering::Acquire);
    loop {
        unsafe { (*page).next.store(cur, Ordering::Relaxed) };
        match head.compare_exchange_weak(cur, page, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
    rt().free_count.fetch_add(1, Ordering::Release);
}

fn note_page_allocated() {
    let since = rt().gc.pages_since_gc.fetch_add(1, Ordering::Relaxed) + 1;
    if since >= rt().tuning.gc_page_trigger.load(Ordering::Relaxed) {
        gc::request(false);
    }
}
