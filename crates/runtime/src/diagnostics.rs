//! Runtime diagnostics for production debugging.
//!
//! Dumps runtime statistics to stderr on demand. All counters are
//! lock-free atomics maintained on the hot paths; the dump only reads.

use glas_core::page::{PAGE_ACTIVE, PAGE_ALLOC_TARGET, PAGE_FREE};
use glas_core::rt::rt;
use std::sync::atomic::Ordering;

/// Dump runtime diagnostics to stderr.
pub fn dump_diagnostics() {
    use std::io::Write;

    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "\n=== Glas Runtime Diagnostics ===");

    let _ = writeln!(out, "\n[Heap]");
    let mut heaps = 0usize;
    let mut h = rt().heaps.load(Ordering::Acquire);
    while !h.is_null() {
        heaps += 1;
        h = unsafe { (*h).next };
    }
    let mut pages = [0usize; 3];
    let mut occupancy = 0usize;
    rt().for_each_page(|p| {
        let page = unsafe { &*p };
        let state = page.state.load(Ordering::Acquire) as usize;
        if state < pages.len() {
            pages[state] += 1;
        }
        if state != PAGE_FREE as usize {
            occupancy += page.occupancy.load(Ordering::Acquire);
        }
    });
    let _ = writeln!(out, "  Heaps: {heaps}");
    let _ = writeln!(
        out,
        "  Pages: {} active, {} allocating, {} free-listed",
        pages[PAGE_ACTIVE as usize], pages[PAGE_ALLOC_TARGET as usize], pages[PAGE_FREE as usize]
    );
    let _ = writeln!(out, "  Live cells (approx): {occupancy}");

    let _ = writeln!(out, "\n[GC]");
    let _ = writeln!(out, "  Cycles: {}", rt().gc.cycles.load(Ordering::Acquire));
    let _ = writeln!(
        out,
        "  Pages since last cycle: {}",
        rt().gc.pages_since_gc.load(Ordering::Acquire)
    );

    let _ = writeln!(out, "\n[Post-commit queues]");
    let _ = writeln!(
        out,
        "  Enqueued: {}  Drained: {}",
        crate::postop::TOTAL_ENQUEUED.load(Ordering::Acquire),
        crate::postop::TOTAL_DRAINED.load(Ordering::Acquire)
    );
    for (name, depth) in crate::postop::queue_depths() {
        let _ = writeln!(out, "  {name}: {depth} pending");
    }
    let _ = writeln!(out);
}
