//! Heap and collector properties, driven through the public API.

use glas_runtime::Glas;
use glas_runtime::core::gc::collect_now;
use glas_runtime::core::page::{MARK_WORDS, PAGE_FREE, PAGE_HEADER_CELLS, Page, magic_for};
use glas_runtime::core::rt::rt;
use glas_runtime::core::{CELL_SIZE, PAGE_SIZE, cell::Cell};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wire GC phase logging through RUST_LOG, e.g. RUST_LOG=glas_core=trace.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn live_cells() -> usize {
    let mut n = 0;
    rt().for_each_page(|p| {
        let page = unsafe { &*p };
        if page.state.load(Ordering::Acquire) != PAGE_FREE {
            n += page.occupancy.load(Ordering::Acquire);
        }
    });
    n
}

#[test]
#[serial]
fn cell_size_and_page_alignment() {
    assert_eq!(size_of::<Cell>(), 32);
    assert_eq!(size_of::<Cell>(), CELL_SIZE);
    let mut g = Glas::new();
    assert!(g.int_push(77i64));
    let cell = g.peek_cell(0).expect("top").0;
    let page = Page::from_interior(cell.cast::<u8>());
    assert_eq!(page as usize % PAGE_SIZE, 0);
}

#[test]
#[serial]
fn allocator_stays_out_of_page_headers() {
    let mut g = Glas::new();
    for i in 0..2000i64 {
        assert!(g.int_push(1000 + i));
    }
    for depth in [0usize, 1, 999, 1999] {
        let cell = g.peek_cell(depth).expect("cell").0;
        let page = unsafe { &*Page::from_interior(cell.cast::<u8>()) };
        assert_eq!(page.magic, magic_for(page as *const Page as usize));
        assert!(page.cell_index(cell) >= PAGE_HEADER_CELLS);
    }
}

#[test]
#[serial]
fn mark_bitmaps_agree_after_quiet_cycles() {
    let mut g = Glas::new();
    for i in 0..500i64 {
        assert!(g.int_push(1000 + i));
    }
    collect_now(true);
    collect_now(true);
    rt().for_each_page(|p| {
        let page = unsafe { &*p };
        if page.state.load(Ordering::Acquire) == PAGE_FREE {
            return;
        }
        let marked = page.marked();
        let marking = page.marking();
        for w in 0..MARK_WORDS {
            assert_eq!(
                marked[w].load(Ordering::Acquire),
                marking[w].load(Ordering::Acquire),
                "bitmap word {w} diverged",
            );
        }
    });
}

#[test]
#[serial]
fn unreachable_values_are_reclaimed() {
    init_tracing();
    let mut g = Glas::new();
    collect_now(true);
    let before = live_cells();
    for i in 0..5000i64 {
        assert!(g.int_push(1000 + i));
    }
    assert!(g.step_commit());
    collect_now(true);
    let mid = live_cells();
    assert!(mid >= before + 5000, "expected growth: {before} -> {mid}");
    assert!(g.data_drop(5000));
    assert!(g.step_commit());
    collect_now(true);
    collect_now(true);
    let after = live_cells();
    assert!(
        after <= before + 64,
        "expected reclamation: before {before}, after {after}"
    );
}

static RELEASED: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_release(_arg: *mut u8) {
    RELEASED.fetch_add(1, Ordering::SeqCst);
}

#[test]
#[serial]
fn foreign_release_runs_exactly_once() {
    let mut g = Glas::new();
    RELEASED.store(0, Ordering::SeqCst);
    assert!(g.foreign_push(
        std::ptr::null_mut(),
        Some(count_release),
        std::ptr::null_mut(),
        false
    ));
    assert!(g.step_commit());
    collect_now(true);
    // still reachable from the stack
    assert_eq!(RELEASED.load(Ordering::SeqCst), 0);
    assert!(g.data_drop(1));
    assert!(g.step_commit());
    collect_now(true);
    assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
    collect_now(true);
    collect_now(true);
    assert_eq!(RELEASED.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn adjacent_slices_rejoin_to_their_origin() {
    let mut g = Glas::new();
    let bytes: Vec<u8> = (0..100).collect();
    assert!(g.binary_push(&bytes));
    let top = g.peek_cell(0).expect("top").0;
    let (orig_data, orig_origin) = unsafe {
        assert_eq!((*top).hdr.type_id, glas_runtime::core::cell::TYPE_BIG_BIN);
        ((*top).data.big_bin.data, (*top).data.big_bin.origin)
    };
    assert!(g.list_split_n(50));
    assert!(g.list_append());
    let joined = g.peek_cell(0).expect("top").0;
    unsafe {
        assert_eq!((*joined).hdr.type_id, glas_runtime::core::cell::TYPE_BIG_BIN);
        let b = (*joined).data.big_bin;
        assert_eq!(b.data, orig_data);
        assert_eq!(b.len, 100);
        assert_eq!(b.origin, orig_origin);
    }
    let mut buf = [0u8; 100];
    assert_eq!(g.binary_peek(0, 100, Some(&mut buf)), (100, true));
    assert_eq!(&buf[..], &bytes[..]);
}

static ZC_RELEASED: AtomicUsize = AtomicUsize::new(0);

unsafe fn zc_release(_arg: *mut u8) {
    ZC_RELEASED.fetch_add(1, Ordering::SeqCst);
}

#[test]
#[serial]
fn zero_copy_push_slices_in_place() {
    let mut g = Glas::new();
    ZC_RELEASED.store(0, Ordering::SeqCst);
    let bytes: Vec<u8> = (0..128).collect();
    let ok = unsafe {
        g.binary_push_zc(bytes.as_ptr(), bytes.len(), Some(zc_release), std::ptr::null_mut())
    };
    assert!(ok);
    let mut buf = [0u8; 128];
    assert_eq!(g.binary_peek(0, 128, Some(&mut buf)), (128, true));
    assert_eq!(&buf[..], &bytes[..]);
    assert_eq!(ZC_RELEASED.load(Ordering::SeqCst), 0);
    assert!(g.data_drop(1));
    assert!(g.step_commit());
    collect_now(true);
    // the runtime let go of the host buffer
    assert_eq!(ZC_RELEASED.load(Ordering::SeqCst), 1);
    drop(bytes);

    // short zero-copy pushes degrade to copies and release eagerly
    ZC_RELEASED.store(0, Ordering::SeqCst);
    let short: Vec<u8> = (0..16).collect();
    let ok = unsafe {
        g.binary_push_zc(short.as_ptr(), short.len(), Some(zc_release), std::ptr::null_mut())
    };
    assert!(ok);
    assert_eq!(ZC_RELEASED.load(Ordering::SeqCst), 1);
    assert!(g.data_drop(1));
}

#[test]
#[serial]
fn diagnostics_dump_smoke() {
    let mut g = Glas::new();
    assert!(g.int_push(1i64));
    glas_runtime::diagnostics::dump_diagnostics();
    assert!(g.data_drop(1));
}

#[test]
#[serial]
fn zero_copy_reads_pin_their_backing() {
    let mut g = Glas::new();
    let bytes: Vec<u8> = (0..80).collect();
    assert!(g.binary_push(&bytes));
    let view = g.binary_peek_zc(10, 20).expect("view");
    assert_eq!(view.bytes(), &bytes[10..30]);
    // collection must not invalidate the pinned view
    collect_now(true);
    assert_eq!(view.bytes(), &bytes[10..30]);
    drop(view);
    assert!(g.data_drop(1));
    assert!(g.step_commit());
    collect_now(true);
}

#[test]
#[serial]
fn zero_copy_read_flattens_ropes_idempotently() {
    let mut g = Glas::new();
    let a: Vec<u8> = (0..40).collect();
    let b: Vec<u8> = (40..90).collect();
    assert!(g.binary_push(&a));
    assert!(g.binary_push(&b));
    assert!(g.list_append());
    {
        let view = g.binary_peek_zc(0, 90).expect("view");
        let want: Vec<u8> = (0..90).collect();
        assert_eq!(view.bytes(), &want[..]);
    }
    // the flattened form is now on the stack: a second read is zero-copy
    let flat1 = g.peek_cell(0).expect("top");
    {
        let _view = g.binary_peek_zc(0, 90).expect("view");
    }
    assert_eq!(g.peek_cell(0), Some(flat1));
}
