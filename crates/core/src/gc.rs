//! The concurrent tricolor collector.
//!
//! Phase machine (one atomic byte; bit 0 = stop request, bit 1 = mark):
//!
//! - Idle (0b00) - no GC activity
//! - Stop (0b01) - stop-the-world requested
//! - Busy (0b11) - collector mutating heap structure, mutators stopped
//! - Mark (0b10) - concurrent mark, mutators run with the write barrier
//!
//! Transitions: Idle→Stop on trigger; Stop→Busy once every mutator is out
//! of Busy; Busy→Mark clears the stop bit and wakes waiting threads;
//! Mark→Busy re-raises stop and waits again; Busy→Idle clears everything.
//!
//! Marking is tricolor over the per-page `marking` bitmaps: clear = white,
//! set + queued = grey, set + scanned = black. Mutators allocate black and
//! run an insertion barrier on pointer stores. Cycles are minor (nursery
//! only) or full; card tables let a minor cycle treat old-to-young edges
//! as roots without scanning old pages wholesale.

use crate::cell::{Cell, CellRef, GC_FINALIZED, TYPE_FOREIGN_PTR, TYPE_SEAL, TYPE_TOMBSTONE};
use crate::page::{
    CARD_FINALIZER, CARD_OLD_TO_YOUNG, PAGE_ALLOC_TARGET, PAGE_FREE, PAGE_HEADER_CELLS, Page,
};
use crate::rt::rt;
use crate::thread::{THREAD_BUSY, THREAD_DONE, THREAD_WAIT};
use crate::{GC_MAX_GEN, PAGE_CELL_COUNT};
use std::sync::atomic::Ordering;
use std::time::Duration;

pub const GC_IDLE: u8 = 0b00;
pub const GC_STOP: u8 = 0b01;
pub const GC_BUSY: u8 = 0b11;
pub const GC_MARK: u8 = 0b10;

/// Whether mutators must stop at their next phase boundary.
#[inline]
pub fn stop_requested() -> bool {
    rt().gc.phase.load(Ordering::SeqCst) & GC_STOP != 0
}

/// Whether the concurrent mark phase is running (write barrier needed).
#[inline]
pub fn marking_active() -> bool {
    rt().gc.phase.load(Ordering::SeqCst) & GC_MARK != 0
}

/// Ask the collector for a cycle. Returns immediately; the returned ticket
/// is satisfied once a cycle that started after this request completes.
pub fn request(full: bool) -> u64 {
    let gc = &rt().gc;
    let mut trig = gc.trigger.lock().expect("gc trigger lock poisoned");
    trig.requested = true;
    trig.full |= full;
    trig.seq += 1;
    let ticket = trig.seq;
    gc.trigger_cv.notify_one();
    ticket
}

/// Run one collection cycle and wait for it to finish. A cycle already in
/// flight does not satisfy the call; one honoring this request does.
///
/// Must not be called from a thread that is currently Busy: the collector
/// would wait forever for it to stop.
pub fn collect_now(full: bool) {
    let gc = &rt().gc;
    let ticket = request(full);
    let mut trig = gc.trigger.lock().expect("gc trigger lock poisoned");
    while gc.completed_seq.load(Ordering::Acquire) < ticket {
        trig = gc.done_cv.wait(trig).expect("gc trigger lock poisoned");
    }
}

/// Collector thread entry point.
pub(crate) fn collector_main() {
    let gc = &rt().gc;
    loop {
        let (full, seq) = {
            let mut trig = gc.trigger.lock().expect("gc trigger lock poisoned");
            while !trig.requested {
                trig = gc.trigger_cv.wait(trig).expect("gc trigger lock poisoned");
            }
            trig.requested = false;
            (std::mem::take(&mut trig.full), trig.seq)
        };
        let cycle = gc.cycles.load(Ordering::Acquire);
        let interval = rt().tuning.gc_full_interval.load(Ordering::Relaxed) as u64;
        let full = full || (interval > 0 && cycle % interval == 0);
        run_cycle(full);
        {
            let _trig = gc.trigger.lock().expect("gc trigger lock poisoned");
            gc.cycles.fetch_add(1, Ordering::AcqRel);
            gc.completed_seq.store(seq, Ordering::Release);
            gc.done_cv.notify_all();
        }
    }
}

fn run_cycle(full: bool) {
    let gc = &rt().gc;
    let target_gen = if full { GC_MAX_GEN } else { 0 };
    gc.collect_gen.store(target_gen, Ordering::SeqCst);
    gc.pages_since_gc.store(0, Ordering::Relaxed);
    tracing::debug!(full, target_gen, "gc cycle begins");

    // Idle → Stop → Busy: first handshake
    gc.phase.store(GC_STOP, Ordering::SeqCst);
    wait_mutators_stopped();
    gc.phase.store(GC_BUSY, Ordering::SeqCst);

    reap_done_threads();
    prepare_pages(target_gen, full);
    scan_roots(target_gen);
    if !full {
        scan_old_to_young(target_gen);
    }

    // Busy → Mark: concurrent phase
    gc.phase.store(GC_MARK, Ordering::SeqCst);
    wake_waiting_threads();
    drain_queue(target_gen, full);

    // Mark → Busy: second handshake
    gc.phase.store(GC_BUSY, Ordering::SeqCst);
    wait_mutators_stopped();
    scan_roots(target_gen);
    drain_queue(target_gen, full);
    weak_and_finalizer_pass(target_gen);
    sweep_pages(target_gen);

    // Busy → Idle
    gc.phase.store(GC_IDLE, Ordering::SeqCst);
    wake_waiting_threads();
    tracing::debug!(full, "gc cycle ends");
}

fn wait_mutators_stopped() {
    loop {
        let mut any_busy = false;
        rt().for_each_thread(|t| {
            if t.state.load(Ordering::SeqCst) == THREAD_BUSY {
                any_busy = true;
            }
        });
        if !any_busy {
            return;
        }
        std::thread::sleep(Duration::from_micros(20));
    }
}

fn wake_waiting_threads() {
    rt().for_each_thread(|t| {
        if t.state.load(Ordering::SeqCst) == THREAD_WAIT {
            t.wake();
        }
    });
}

/// Unlink and free thread records whose owners finished. Runs while
/// mutators are stopped; insertion only races on the list head, which is
/// CAS-retried.
fn reap_done_threads() {
    let head = &rt().threads;
    // drop done records from the head
    loop {
        let first = head.load(Ordering::Acquire);
        if first.is_null() {
            return;
        }
        let t = unsafe { &*first };
        if t.state.load(Ordering::Acquire) != THREAD_DONE {
            break;
        }
        let next = t.next.load(Ordering::Acquire);
        if head
            .compare_exchange(first, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe { free_thread_record(first) };
        }
    }
    // interior records are only ever unlinked here, so plain stores do
    let mut prev = head.load(Ordering::Acquire);
    if prev.is_null() {
        return;
    }
    let mut cur = unsafe { (*prev).next.load(Ordering::Acquire) };
    while !cur.is_null() {
        let t = unsafe { &*cur };
        let next = t.next.load(Ordering::Acquire);
        if t.state.load(Ordering::Acquire) == THREAD_DONE {
            unsafe { (*prev).next.store(next, Ordering::Release) };
            unsafe { free_thread_record(cur) };
        } else {
            prev = cur;
        }
        cur = next;
    }
}

unsafe fn free_thread_record(t: *mut crate::thread::MutatorThread) {
    unsafe {
        if let Some(drop_roots) = (*t).roots_drop {
            drop_roots((*t).roots_obj);
        }
        drop(Box::from_raw(t));
    }
}

/// Reset the marking bitmaps of every page this cycle collects. On a full
/// cycle the old-to-young cards are cleared too; marking re-derives them.
fn prepare_pages(target_gen: u32, full: bool) {
    rt().for_each_page(|p| {
        let page = unsafe { &*p };
        if page.state.load(Ordering::Acquire) == PAGE_FREE {
            return;
        }
        if page.generation() <= target_gen {
            page.reset_marking();
        }
        if full {
            page.clear_cards(CARD_OLD_TO_YOUNG);
        }
    });
    rt().gc.queue.lock().expect("gc queue lock poisoned").clear();
}

fn scan_roots(target_gen: u32) {
    rt().for_each_thread(|t| {
        if t.state.load(Ordering::Acquire) != THREAD_DONE {
            unsafe { t.for_each_root(&mut |c| shade(c, target_gen)) };
        }
    });
    shade(rt().globals.load(Ordering::Acquire), target_gen);
    for pin in rt().pins.lock().expect("pin lock poisoned").iter() {
        shade(pin.0, target_gen);
    }
}

/// Minor cycles: cells of older pages sitting on a set old-to-young card
/// may reference the collected generations; scan them as roots.
fn scan_old_to_young(target_gen: u32) {
    rt().for_each_page(|p| {
        let page = unsafe { &*p };
        if page.state.load(Ordering::Acquire) == PAGE_FREE || page.generation() <= target_gen {
            return;
        }
        let marked = page.marked();
        page.for_each_set_card(CARD_OLD_TO_YOUNG, |first, last| {
            for ix in first.max(PAGE_HEADER_CELLS)..last.min(PAGE_CELL_COUNT) {
                if Page::is_marked(marked, ix) {
                    let cell = page.cell_at(ix);
                    unsafe { (*cell).for_each_child(&mut |c| shade(c, target_gen)) };
                }
            }
        });
    });
}

/// Shade a cell grey: set its mark bit and queue it for scanning. Cells in
/// pages older than the collected generations are outside this wave.
pub fn shade(cell: *mut Cell, target_gen: u32) {
    if cell.is_null() {
        return;
    }
    let page = unsafe { &*Page::from_interior(cell.cast::<u8>()) };
    if page.generation() > target_gen {
        return;
    }
    let ix = page.cell_index(cell);
    if Page::set_mark(page.marking(), ix) {
        rt().gc
            .queue
            .lock()
            .expect("gc queue lock poisoned")
            .push(CellRef(cell));
    }
}

fn drain_queue(target_gen: u32, full: bool) {
    loop {
        let batch = {
            let mut q = rt().gc.queue.lock().expect("gc queue lock poisoned");
            if q.is_empty() {
                return;
            }
            std::mem::take(&mut *q)
        };
        for CellRef(cell) in batch {
            unsafe { scan_cell(cell, target_gen, full) };
        }
    }
}

/// Scan one grey cell: shade its children; on full cycles re-derive the
/// old-to-young card when a child is younger than the holder.
unsafe fn scan_cell(cell: *mut Cell, target_gen: u32, full: bool) {
    let holder_page = unsafe { &*Page::from_interior(cell.cast::<u8>()) };
    let holder_gen = holder_page.generation();
    unsafe {
        (*cell).for_each_child(&mut |child| {
            if child.is_null() {
                return;
            }
            if full {
                let child_page = unsafe { &*Page::from_interior(child.cast::<u8>()) };
                if child_page.generation() < holder_gen {
                    holder_page.set_card(CARD_OLD_TO_YOUNG, cell as usize);
                }
            }
            shade(child, target_gen);
        });
    }
}

/// Whether a referenced cell died in this cycle.
fn ref_dead(cell: *mut Cell, target_gen: u32) -> bool {
    if cell.is_null() {
        return false;
    }
    let page = unsafe { &*Page::from_interior(cell.cast::<u8>()) };
    if page.generation() > target_gen {
        return false;
    }
    !Page::is_marked(page.marking(), page.cell_index(cell))
}

/// Null dead tombstone targets, clear seal payloads whose keys died, and
/// run release callbacks of dead foreign pointers. Card-filtered; runs
/// while mutators are stopped, before the bitmap swap.
fn weak_and_finalizer_pass(target_gen: u32) {
    rt().for_each_page(|p| {
        let page = unsafe { &*p };
        if page.state.load(Ordering::Acquire) == PAGE_FREE {
            return;
        }
        let collected = page.generation() <= target_gen;
        page.for_each_set_card(CARD_FINALIZER, |first, last| {
            for ix in first.max(PAGE_HEADER_CELLS)..last.min(PAGE_CELL_COUNT) {
                let cell = page.cell_at(ix);
                let live = !collected || Page::is_marked(page.marking(), ix);
                let c = unsafe { &*cell };
                match c.hdr.type_id {
                    TYPE_FOREIGN_PTR => {
                        if !live && c.gc_set(GC_FINALIZED) & GC_FINALIZED == 0 {
                            let f = unsafe { c.data.foreign };
                            if let Some(release) = f.release {
                                tracing::trace!(?cell, "running foreign release");
                                unsafe { release(f.arg) };
                            }
                        }
                    }
                    TYPE_TOMBSTONE if live => {
                        let target = unsafe { c.load_ptr(0) };
                        if ref_dead(target, target_gen) {
                            unsafe {
                                c.word_atomic(0).store(std::ptr::null_mut(), Ordering::Release);
                            }
                        }
                    }
                    TYPE_SEAL if live => {
                        let key = unsafe { c.data.seal.key };
                        if ref_dead(key, target_gen) {
                            unsafe {
                                // ephemeron: sealed data dies with its key
                                c.word_atomic(1).store(std::ptr::null_mut(), Ordering::Release);
                            }
                        }
                    }
                    _ => {}
                }
            }
        });
    });
}

/// Swap bitmaps on collected pages, recount occupancy, promote survivors,
/// recycle empty pages.
fn sweep_pages(target_gen: u32) {
    let promote_after = rt().tuning.gc_promote_cycles.load(Ordering::Relaxed);
    let mut freed = 0usize;
    rt().for_each_page(|p| {
        let page = unsafe { &*p };
        let state = page.state.load(Ordering::Acquire);
        if state == PAGE_FREE || page.generation() > target_gen {
            return;
        }
        let live = Page::live_count(page.marking());
        page.occupancy.store(live, Ordering::Release);
        page.swap_bitmaps();
        let cycle = page.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        if live == 0 && state != PAGE_ALLOC_TARGET {
            freed += 1;
            crate::alloc::release_page(p);
        } else if cycle >= promote_after
            && page.generation() < GC_MAX_GEN
            && state != PAGE_ALLOC_TARGET
        {
            page.set_generation(page.generation() + 1);
            page.cycle.store(0, Ordering::Relaxed);
            // outgoing references are now suspect until the next full cycle
            page.set_all_cards(CARD_OLD_TO_YOUNG);
        }
    });
    if freed > 0 {
        tracing::debug!(freed, "pages recycled");
    }
}

/// Insertion write barrier: store `value` into payload word `word` of
/// `holder` and keep the mark wave consistent. All in-place pointer
/// mutation of reachable cells must go through here (or pair a CAS with
/// [`ref_published`]).
///
/// # Safety
/// `word` must be a pointer payload word of `holder`; both cells must be
/// live.
pub unsafe fn write_ref(holder: *mut Cell, word: usize, value: *mut Cell) {
    unsafe {
        (*holder).word_atomic(word).store(value, Ordering::Release);
    }
    ref_published(holder, value);
}

/// Barrier bookkeeping for a pointer already stored into `holder` (via a
/// CAS the caller performed): old-to-young card, and grey-shading of the
/// target during concurrent mark.
pub fn ref_published(holder: *mut Cell, value: *mut Cell) {
    if value.is_null() {
        return;
    }
    let hp = unsafe { &*Page::from_interior(holder.cast::<u8>()) };
    let vp = unsafe { &*Page::from_interior(value.cast::<u8>()) };
    if hp.generation() > vp.generation() {
        hp.set_card(CARD_OLD_TO_YOUNG, holder as usize);
    }
    if marking_active() {
        let target_gen = rt().gc.collect_gen.load(Ordering::SeqCst);
        if vp.generation() > target_gen {
            return;
        }
        // shade the target if the holder is already black or grey; a white
        // holder will rediscover the edge when it is scanned
        let holder_marked = hp.generation() > target_gen
            || Page::is_marked(hp.marking(), hp.cell_index(holder));
        if holder_marked {
            shade(value, target_gen);
        }
    }
}

/// Publish a freshly initialized cell: during concurrent mark its children
/// must be shaded, since the cell itself was allocated black and will not
/// be scanned.
pub fn publish_cell(cell: *mut Cell) {
    if cell.is_null() || !marking_active() {
        return;
    }
    let target_gen = rt().gc.collect_gen.load(Ordering::SeqCst);
    unsafe {
        (*cell).for_each_child(&mut |child| shade(child, target_gen));
    }
}
