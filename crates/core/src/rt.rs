//! The process-wide runtime singleton.
//!
//! Holds the heap list, free-page list, thread list, globals root, GC
//! shared state, tuning knobs, and the vfs hook. Each field is separately
//! synchronised: list heads are CAS-updated atomic pointers, the vfs hook
//! sits behind its own mutex, and register publication is serialised by
//! the commit lock.

use crate::cell::{Cell, CellRef};
use crate::gc;
use crate::mem::Heap;
use crate::page::Page;
use crate::thread::MutatorThread;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

/// File loader callback: resolves a source path to file bytes. Installed
/// by the host; the loader itself lives outside the core.
pub type VfsCallback = Box<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;

/// Collector trigger request.
#[derive(Default)]
pub(crate) struct GcTrigger {
    pub requested: bool,
    pub full: bool,
    /// Ticket counter; a completed cycle satisfies tickets up to the seq
    /// it was started with.
    pub seq: u64,
}

/// Shared GC coordination state.
pub struct GcShared {
    /// Phase byte: bit 0 = stop requested, bit 1 = mark active.
    pub phase: AtomicU8,
    /// Highest generation collected by the current cycle.
    pub collect_gen: AtomicU32,
    /// Grey queue: cells shaded but not yet scanned.
    pub queue: Mutex<Vec<CellRef>>,
    /// Completed collection cycles.
    pub cycles: AtomicU64,
    /// Highest request ticket honored so far.
    pub completed_seq: AtomicU64,
    /// Pages handed to allocators since the last collection.
    pub pages_since_gc: AtomicUsize,
    pub(crate) trigger: Mutex<GcTrigger>,
    pub(crate) trigger_cv: Condvar,
    pub(crate) done_cv: Condvar,
}

/// Tuning knobs, written once by configuration and read everywhere.
pub struct Tuning {
    /// Every n-th background cycle is a full collection.
    pub gc_full_interval: AtomicU32,
    /// Cycles a page must survive before promotion.
    pub gc_promote_cycles: AtomicU32,
    /// Background collection triggers after this many fresh pages.
    pub gc_page_trigger: AtomicUsize,
    /// Pages kept on the free list instead of returned to the OS.
    pub free_pages_keep: AtomicUsize,
    /// Cell allocations allowed per step before E_QUOTA.
    pub step_quota: AtomicUsize,
    /// Post-commit queue bound; committers stall above it.
    pub postop_queue_bound: AtomicUsize,
}

/// The `glas_rt` singleton.
pub struct GlasRt {
    /// Stable-id generator (tombstones, registers).
    pub idgen: AtomicU64,
    /// Heap list; the head is the newest, not-yet-full heap.
    pub heaps: AtomicPtr<Heap>,
    /// Recycled pages ready for reuse.
    pub free_pages: AtomicPtr<Page>,
    pub free_count: AtomicUsize,
    /// Collector's view of mutator threads.
    pub threads: AtomicPtr<MutatorThread>,
    /// Lazy global register volume.
    pub globals: AtomicPtr<Cell>,
    /// Cells pinned by zero-copy reads handed to the host.
    pub pins: Mutex<Vec<CellRef>>,
    /// File loader hook.
    pub vfs: Mutex<Option<VfsCallback>>,
    /// Serialises register publication at step commit.
    pub commit_lock: Mutex<()>,
    pub gc: GcShared,
    pub tuning: Tuning,
}

static RT: OnceLock<GlasRt> = OnceLock::new();

/// The runtime singleton; the collector thread is spawned on first use.
pub fn rt() -> &'static GlasRt {
    RT.get_or_init(|| {
        std::thread::Builder::new()
            .name("glas-gc".into())
            .spawn(gc::collector_main)
            .expect("failed to spawn collector thread");
        GlasRt {
            idgen: AtomicU64::new(1),
            heaps: AtomicPtr::new(std::ptr::null_mut()),
            free_pages: AtomicPtr::new(std::ptr::null_mut()),
            free_count: AtomicUsize::new(0),
            threads: AtomicPtr::new(std::ptr::null_mut()),
            globals: AtomicPtr::new(std::ptr::null_mut()),
            pins: Mutex::new(Vec::new()),
            vfs: Mutex::new(None),
            commit_lock: Mutex::new(()),
            gc: GcShared {
                phase: AtomicU8::new(gc::GC_IDLE),
                collect_gen: AtomicU32::new(0),
                queue: Mutex::new(Vec::new()),
                cycles: AtomicU64::new(0),
                completed_seq: AtomicU64::new(0),
                pages_since_gc: AtomicUsize::new(0),
                trigger: Mutex::new(GcTrigger::default()),
                trigger_cv: Condvar::new(),
                done_cv: Condvar::new(),
            },
            tuning: Tuning {
                gc_full_interval: AtomicU32::new(4),
                gc_promote_cycles: AtomicU32::new(2),
                gc_page_trigger: AtomicUsize::new(8),
                free_pages_keep: AtomicUsize::new(16),
                step_quota: AtomicUsize::new(1 << 24),
                postop_queue_bound: AtomicUsize::new(1024),
            },
        }
    })
}

impl GlasRt {
    /// Next stable id.
    #[inline]
    pub fn genid(&self) -> u64 {
        self.idgen.fetch_add(1, Ordering::Relaxed)
    }

    /// Install (or replace) the file loader hook.
    pub fn vfs_intercept(&self, cb: VfsCallback) {
        *self.vfs.lock().expect("vfs lock poisoned") = Some(cb);
    }

    /// Pin a cell against collection until [`GlasRt::unpin`].
    pub fn pin(&self, cell: *mut Cell) {
        self.pins.lock().expect("pin lock poisoned").push(CellRef(cell));
    }

    /// Drop one pin of `cell`.
    pub fn unpin(&self, cell: *mut Cell) {
        let mut pins = self.pins.lock().expect("pin lock poisoned");
        if let Some(ix) = pins.iter().position(|p| p.0 == cell) {
            pins.swap_remove(ix);
        }
    }

    /// Walk every live thread record.
    pub fn for_each_thread(&self, mut f: impl FnMut(&MutatorThread)) {
        let mut cur = self.threads.load(Ordering::Acquire);
        while !cur.is_null() {
            let t = unsafe { &*cur };
            f(t);
            cur = t.next.load(Ordering::Acquire);
        }
    }

    /// Walk every claimed page of every heap. Free-list pages are included
    /// (their state says so); callers filter on `state`.
    pub fn for_each_page(&self, mut f: impl FnMut(*mut Page)) {
        let mut heap = self.heaps.load(Ordering::Acquire);
        while !heap.is_null() {
            let h = unsafe { &*heap };
            h.for_each_claimed(|addr| f(addr as *mut Page));
            heap = h.next;
        }
    }
}
