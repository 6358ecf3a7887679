//! The collector's view of a mutator thread.
//!
//! States and transitions:
//! - Done - thread finished, collector reaps the record when busy
//! - Idle - not executing, or waiting on non-GC events
//! - Busy - mutating heap, blocks the collector's busy phases
//! - Wait - suspended until the collector completes
//!
//! A mutator flips Idle→Busy, then re-reads the GC state; if a stop is
//! requested it parks in Wait until the collector wakes it. Busy→Idle is a
//! single store. Done is sticky.
//!
//! Roots are described by a pointer to an opaque object plus a static
//! slice of byte offsets to `*mut Cell` fields. The descriptor is
//! immutable once registered, so the collector scans roots without
//! synchronising with thread internals; root contents may change only
//! while the thread is busy.

use crate::cell::Cell;
use crate::gc;
use crate::rt::rt;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

pub const THREAD_DONE: u8 = 0;
pub const THREAD_IDLE: u8 = 1;
pub const THREAD_BUSY: u8 = 2;
pub const THREAD_WAIT: u8 = 3;

/// Per-mutator record linked into the runtime's thread list.
pub struct MutatorThread {
    /// Next thread in the global list.
    pub next: AtomicPtr<MutatorThread>,
    pub state: AtomicU8,
    /// Wakeup permit, posted by the collector.
    wake: Mutex<bool>,
    wake_cv: Condvar,
    /// Root block of the owning context.
    pub roots_obj: *mut u8,
    /// Byte offsets of `*mut Cell` fields within the root block.
    pub roots_offsets: &'static [u16],
    /// Frees the root block when the collector reaps this record. The
    /// owner must not free it itself: the collector may still scan the
    /// roots of a context that went Done mid-cycle.
    pub roots_drop: Option<unsafe fn(*mut u8)>,
}

unsafe impl Send for MutatorThread {}
unsafe impl Sync for MutatorThread {}

impl MutatorThread {
    /// Create a thread record and link it into the runtime's list.
    ///
    /// The record starts Idle. It is freed by the collector after the
    /// owner marks it Done; `roots_drop`, if given, frees the root block
    /// at the same point.
    pub fn register(
        roots_obj: *mut u8,
        roots_offsets: &'static [u16],
        roots_drop: Option<unsafe fn(*mut u8)>,
    ) -> *mut MutatorThread {
        let t = Box::into_raw(Box::new(MutatorThread {
            next: AtomicPtr::new(std::ptr::null_mut()),
            state: AtomicU8::new(THREAD_IDLE),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            roots_obj,
            roots_offsets,
            roots_drop,
        }));
        let head = &rt().threads;
        let mut cur = head.load(Ordering::Acquire);
        loop {
            unsafe { (*t).next.store(cur, Ordering::Relaxed) };
            match head.compare_exchange_weak(cur, t, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        t
    }

    /// Idle→Busy, parking in Wait while the collector holds a stop
    /// request. On return the thread is Busy and may touch the heap.
    pub fn enter_busy(&self) {
        loop {
            self.state.store(THREAD_BUSY, Ordering::SeqCst);
            if !gc::stop_requested() {
                return;
            }
            self.state.store(THREAD_WAIT, Ordering::SeqCst);
            if !gc::stop_requested() {
                // stop retracted between the store and the recheck; the
                // collector's wake pass may already be over
                self.state.store(THREAD_IDLE, Ordering::SeqCst);
                continue;
            }
            self.wait_for_wake();
            self.state.store(THREAD_IDLE, Ordering::SeqCst);
        }
    }

    /// Busy→Idle.
    #[inline]
    pub fn leave_busy(&self) {
        self.state.store(THREAD_IDLE, Ordering::Release);
    }

    /// Mark the thread finished. Sticky; the collector reaps the record.
    pub fn finish(&self) {
        self.state.store(THREAD_DONE, Ordering::Release);
    }

    /// Post this thread's wakeup permit.
    pub fn wake(&self) {
        let mut flag = self.wake.lock().expect("thread wake lock poisoned");
        *flag = true;
        self.wake_cv.notify_all();
    }

    fn wait_for_wake(&self) {
        let mut flag = self.wake.lock().expect("thread wake lock poisoned");
        while !*flag {
            flag = self.wake_cv.wait(flag).expect("thread wake lock poisoned");
        }
        *flag = false;
    }

    /// Read the root cells named by the descriptor. Only meaningful while
    /// the thread is stopped or the caller is the thread itself.
    ///
    /// # Safety
    /// `roots_obj` must still be live.
    pub unsafe fn for_each_root(&self, f: &mut impl FnMut(*mut Cell)) {
        for &off in self.roots_offsets {
            let slot = unsafe { self.roots_obj.add(off as usize) }.cast::<*mut Cell>();
            f(unsafe { slot.read() });
        }
    }
}

/// RAII guard for a busy window.
pub struct BusyGuard<'a> {
    thread: &'a MutatorThread,
}

impl<'a> BusyGuard<'a> {
    pub fn enter(thread: &'a MutatorThread) -> Self {
        thread.enter_busy();
        BusyGuard { thread }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.thread.leave_busy();
    }
}
